//! Recognized configuration knobs for the SSH layer, check engine, store
//! and session keeper. Loadable from a TOML file or used as sensible
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ssh: SshConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ssh: SshConfig::default(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKeyVerification {
    #[serde(rename = "tofu")]
    Tofu,
    #[serde(rename = "insecure")]
    Insecure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub max_connections: usize,
    pub connection_ttl_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub host_key_verification: HostKeyVerification,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            max_retries: 2,
            retry_delay_secs: 1,
            max_connections: 4,
            connection_ttl_secs: 300,
            keep_alive_interval_secs: 30,
            host_key_verification: HostKeyVerification::Tofu,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalMode {
    #[serde(rename = "wal")]
    Wal,
    #[serde(rename = "delete")]
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub journal_mode: JournalMode,
    pub busy_timeout_secs: u64,
    pub cache_size_kib: i64,
    pub temp_store_memory: bool,
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            journal_mode: JournalMode::Wal,
            busy_timeout_secs: 30,
            cache_size_kib: 2000,
            temp_store_memory: true,
            path: default_data_path(),
        }
    }
}

/// The data directory layout is a single directory holding
/// `network_checker.db` and any backups produced alongside it. When
/// the platform exposes a standard data directory, the database lives
/// there by default; otherwise it falls back to the working directory.
fn default_data_path() -> String {
    match dirs::data_dir() {
        Some(dir) => dir
            .join("netaudit-core")
            .join("network_checker.db")
            .to_string_lossy()
            .into_owned(),
        None => "network_checker.db".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub session_timeout_secs: u64,
    pub max_login_attempts: u32,
    pub lockout_duration_secs: u64,
    pub key_derivation_iterations: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            session_timeout_secs: 3600,
            max_login_attempts: 5,
            lockout_duration_secs: 300,
            key_derivation_iterations: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.engine.worker_count, config.engine.worker_count);
    }
}
