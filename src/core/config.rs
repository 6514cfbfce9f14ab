use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for one streaming buffer (16 MiB).
pub const MAX_CHUNK_SIZE_KB: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_storage_path() -> String {
    "./storage".to_string()
}
fn default_file_extension() -> String {
    ".dcm".to_string()
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_chunk_size_kb() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            file_extension: default_file_extension(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_size_kb: default_chunk_size_kb(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb.saturating_mul(1024)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.trim().is_empty() {
            anyhow::bail!("storage_path must not be empty");
        }
        if !self.file_extension.starts_with('.') || self.file_extension.len() < 2 {
            anyhow::bail!("file_extension must start with '.' and name an extension");
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 60_000 {
            anyhow::bail!("poll_interval_ms must be between 1 and 60000");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be > 0");
        }
        if self.chunk_size_kb == 0 || self.chunk_size_kb > MAX_CHUNK_SIZE_KB {
            anyhow::bail!("chunk_size_kb must be between 1 and {}", MAX_CHUNK_SIZE_KB);
        }
        Ok(())
    }
}

// --- Database-backed config ---

use crate::db;
use rusqlite::Connection;

pub fn load_config_from_db(conn: &Connection) -> Result<Config> {
    let settings = db::load_all_settings(conn)?;

    let get_or = |key: &str, default: String| -> String {
        settings
            .get(key)
            .cloned()
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
    };

    let get_u64 = |key: &str, default: u64| -> u64 {
        settings
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };

    let get_usize = |key: &str, default: usize| -> usize {
        settings
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };

    Ok(Config {
        storage_path: get_or("storage_path", default_storage_path()),
        file_extension: get_or("file_extension", default_file_extension()),
        poll_interval_ms: get_u64("poll_interval_ms", default_poll_interval_ms()),
        connect_timeout_secs: get_u64("connect_timeout_secs", default_connect_timeout_secs()),
        chunk_size_kb: get_usize("chunk_size_kb", default_chunk_size_kb()),
        log_level: get_or("log_level", default_log_level()),
    })
}

pub fn save_config_to_db(conn: &Connection, cfg: &Config) -> Result<()> {
    db::set_setting(conn, "storage_path", &cfg.storage_path)?;
    db::set_setting(conn, "file_extension", &cfg.file_extension)?;
    db::set_setting(conn, "poll_interval_ms", &cfg.poll_interval_ms.to_string())?;
    db::set_setting(
        conn,
        "connect_timeout_secs",
        &cfg.connect_timeout_secs.to_string(),
    )?;
    db::set_setting(conn, "chunk_size_kb", &cfg.chunk_size_kb.to_string())?;
    db::set_setting(conn, "log_level", &cfg.log_level)?;
    Ok(())
}
