use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::RecordBackend;
use crate::error::StoreError;
use crate::models::UserRecord;

/// Process-local records. Everything is lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.records.read().get(user_id).cloned())
    }

    async fn save(&self, record: &UserRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
