// Persistence boundary: the engine saves and loads its exported form
// through an injected adapter keyed by a fixed storage identifier. The
// engine never owns the storage mechanism; a file-backed adapter is
// provided for local durable storage and an in-memory one for tests and
// ephemeral sessions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::snapshot::Snapshot;
use super::GlobalState;

/// Fixed storage key for the viewer state payload.
pub const STORAGE_KEY: &str = "unified-viewer-state";

/// Version tag written into exported payloads.
pub const EXPORT_VERSION: u32 = 1;

/// The store's exported form: `{ state, snapshots, version, exported_at }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedState {
    pub state: GlobalState,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
}

impl ExportedState {
    pub fn new(state: GlobalState, snapshots: Vec<Snapshot>, now: DateTime<Utc>) -> Self {
        Self { state, snapshots, version: EXPORT_VERSION, exported_at: now }
    }

    /// Validate and parse an import payload. A payload missing the
    /// required `state` key (or otherwise malformed) yields `None`;
    /// callers reject it without touching live state.
    pub fn from_value(payload: &Value) -> Option<Self> {
        payload.get("state")?;
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize exported state")
    }
}

/// Injected save/load capability for durable local storage.
pub trait StatePersistence {
    fn save(&mut self, key: &str, payload: &Value) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<Value>>;
}

/// File-backed adapter: one pretty-printed JSON file per key.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StatePersistence for FilePersistence {
    fn save(&mut self, key: &str, payload: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create persistence directory `{}`", self.dir.display())
        })?;
        let path = self.path_for(key);
        let contents =
            serde_json::to_string_pretty(payload).context("failed to serialize state payload")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write state file `{}`", path.display()))
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file `{}`", path.display()))?;
        let payload = serde_json::from_str(&contents)
            .with_context(|| format!("state file `{}` is not valid JSON", path.display()))?;
        Ok(Some(payload))
    }
}

/// In-memory adapter for tests and purely ephemeral sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    entries: HashMap<String, Value>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatePersistence for MemoryPersistence {
    fn save(&mut self, key: &str, payload: &Value) -> Result<()> {
        self.entries.insert(key.to_string(), payload.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        "2026-02-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn exported_state_round_trips_through_value() {
        let exported = ExportedState::new(GlobalState::default(), vec![], now());
        let value = exported.to_value().unwrap();
        let back = ExportedState::from_value(&value).expect("payload should parse");
        assert_eq!(back, exported);
        assert_eq!(back.version, EXPORT_VERSION);
    }

    #[test]
    fn import_without_state_key_is_rejected() {
        let payload = json!({"snapshots": [], "version": 1});
        assert!(ExportedState::from_value(&payload).is_none());
    }

    #[test]
    fn import_of_non_object_is_rejected() {
        assert!(ExportedState::from_value(&json!("garbage")).is_none());
        assert!(ExportedState::from_value(&json!(null)).is_none());
    }

    #[test]
    fn file_adapter_round_trips_under_storage_key() {
        let dir = TempDir::new().unwrap();
        let mut adapter = FilePersistence::new(dir.path());

        let payload = ExportedState::new(GlobalState::default(), vec![], now())
            .to_value()
            .unwrap();
        adapter.save(STORAGE_KEY, &payload).unwrap();

        let loaded = adapter.load(STORAGE_KEY).unwrap().expect("payload should exist");
        assert_eq!(loaded, payload);
        assert!(dir.path().join("unified-viewer-state.json").exists());
    }

    #[test]
    fn file_adapter_load_missing_key_returns_none() {
        let dir = TempDir::new().unwrap();
        let adapter = FilePersistence::new(dir.path());
        assert!(adapter.load(STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn file_adapter_surfaces_corrupt_payloads_as_errors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("unified-viewer-state.json"), "{broken").unwrap();
        let adapter = FilePersistence::new(dir.path());
        assert!(adapter.load(STORAGE_KEY).is_err());
    }

    #[test]
    fn memory_adapter_round_trips() {
        let mut adapter = MemoryPersistence::new();
        adapter.save(STORAGE_KEY, &json!({"state": {}})).unwrap();
        assert_eq!(adapter.load(STORAGE_KEY).unwrap(), Some(json!({"state": {}})));
        assert_eq!(adapter.load("other").unwrap(), None);
    }
}
