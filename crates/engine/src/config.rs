// Local engine configuration.
//
// Global config lives at `~/.slicesync/config.toml`. Every field has a
// default so a missing or partial file always yields a usable config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root directory for slicesync local state: `~/.slicesync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".slicesync"))
}

/// Path to the config file: `~/.slicesync/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Sync endpoint (e.g. `wss://sync.example.com/v1`). None = local only.
    pub transport_url: Option<String>,
    /// Display name announced when joining sessions.
    pub display_name: Option<String>,
    /// Maximum number of retained snapshots.
    pub snapshot_cap: usize,
    /// Join handshake deadline in milliseconds.
    pub join_timeout_ms: u64,
    /// Concurrent-edit detection window in milliseconds.
    pub conflict_window_ms: u64,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Bound on the offline outbound queue (drop-oldest beyond it).
    pub max_queued_messages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport_url: None,
            display_name: None,
            snapshot_cap: 50,
            join_timeout_ms: 5_000,
            conflict_window_ms: 500,
            reconnect: ReconnectConfig::default(),
            max_queued_messages: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 500, max_delay_ms: 30_000, max_attempts: 5 }
    }
}

impl EngineConfig {
    /// Load from `~/.slicesync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.snapshot_cap, 50);
        assert_eq!(cfg.join_timeout_ms, 5_000);
        assert_eq!(cfg.conflict_window_ms, 500);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.max_queued_messages, 1_024);
        assert!(cfg.transport_url.is_none());
    }

    #[test]
    fn round_trips_through_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = EngineConfig {
            transport_url: Some("wss://sync.example.com/v1".into()),
            display_name: Some("Dr. A".into()),
            snapshot_cap: 10,
            ..Default::default()
        };
        cfg.save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
snapshot_cap = 5

[reconnect]
max_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.snapshot_cap, 5);
        assert_eq!(cfg.reconnect.max_attempts, 2);
        assert_eq!(cfg.reconnect.base_delay_ms, 500); // default
        assert_eq!(cfg.join_timeout_ms, 5_000); // default
    }

    #[test]
    fn missing_file_is_an_error_from_load_from() {
        let dir = TempDir::new().unwrap();
        assert!(EngineConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep").join("config.toml");
        EngineConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }
}
