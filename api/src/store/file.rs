use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::RecordBackend;
use crate::error::StoreError;
use crate::models::UserRecord;

/// One pretty-printed JSON file per user: `<data_dir>/<user_id>.json`.
pub struct FileBackend {
    data_dir: PathBuf,
}

impl FileBackend {
    /// Creates the data directory if it does not exist yet.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).await?;
        tracing::info!("user data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        let escapes = user_id.is_empty()
            || user_id == "."
            || user_id == ".."
            || user_id.contains(&['/', '\\', '\0'][..]);
        if escapes {
            return Err(StoreError::InvalidUserId(user_id.to_string()));
        }

        Ok(self.data_dir.join(format!("{user_id}.json")))
    }
}

#[async_trait]
impl RecordBackend for FileBackend {
    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let path = self.record_path(user_id)?;

        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_slice(&raw).map_err(|e| {
            tracing::error!("failed to parse {}: {}", path.display(), e);
            e
        })?;
        Ok(Some(record))
    }

    async fn save(&self, record: &UserRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.user_id)?;
        let json = serde_json::to_vec_pretty(record)?;

        // write aside then rename, so a crash never leaves a half-written record
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!("saved {}", path.display());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = fs::read_dir(&self.data_dir).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}
