use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_HISTORY_CAP: usize = 1000;
pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_LLM_MODEL: &str = "claude-3-sonnet-20240229";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow!("unknown storage kind {other:?}, expected file or memory")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Server-side key. When unset, callers must send `Authorization: Bearer`.
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage: StorageKind,
    pub data_dir: PathBuf,
    pub history_cap: usize,
    pub llm: LlmConfig,
}

/// A cap of 0 would erase every history on the next action.
pub fn check_history_cap(cap: usize) -> Result<usize> {
    if cap == 0 {
        return Err(anyhow!("HISTORY_CAP must be at least 1"));
    }
    Ok(cap)
}

impl Config {
    /// Reads the environment. Call `dotenvy::dotenv()` first if a `.env` file
    /// should be honoured.
    pub fn from_env() -> Result<Self> {
        let history_cap = check_history_cap(try_load("HISTORY_CAP", DEFAULT_HISTORY_CAP)?)?;

        Ok(Self {
            port: try_load("PORT", 3001)?,
            storage: try_load("STORAGE", StorageKind::File)?,
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./user_data")),
            history_cap,
            llm: LlmConfig {
                api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
                endpoint: env::var("LLM_ENDPOINT")
                    .unwrap_or_else(|_| DEFAULT_LLM_ENDPOINT.to_string()),
                model: env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
                max_tokens: try_load("LLM_MAX_TOKENS", 2000)?,
            },
        })
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid {key} value {raw:?}")),
        Err(_) => {
            tracing::debug!("{} not set, using default", key);
            Ok(default)
        }
    }
}
