//! Settings persistence

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from loading or saving persisted settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No configuration directory available on this platform")]
    NoConfigDir,

    #[error("Settings store lock poisoned")]
    Poisoned,
}

/// Key/value storage for sonar parameters
pub trait SettingsStore: Send {
    /// Load the persisted map; an absent store yields an empty map
    fn load(&self) -> Result<BTreeMap<String, i64>, SettingsError>;

    /// Replace the persisted map
    fn save(&mut self, values: &BTreeMap<String, i64>) -> Result<(), SettingsError>;
}

/// Settings kept as a pretty-printed JSON object on disk
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/ping1d/settings.json`
    pub fn default_location() -> Result<Self, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(Self::new(dir.join("ping1d").join("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SettingsStore for JsonSettingsFile {
    fn load(&self) -> Result<BTreeMap<String, i64>, SettingsError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&mut self, values: &BTreeMap<String, i64>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let content = serde_json::to_string_pretty(values).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, content).map_err(|e| self.io_error(e))
    }
}

/// In-memory store; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<BTreeMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new(values: BTreeMap<String, i64>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<BTreeMap<String, i64>, SettingsError> {
        self.values
            .lock()
            .map(|v| v.clone())
            .map_err(|_| SettingsError::Poisoned)
    }

    fn save(&mut self, values: &BTreeMap<String, i64>) -> Result<(), SettingsError> {
        let mut guard = self.values.lock().map_err(|_| SettingsError::Poisoned)?;
        *guard = values.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonSettingsFile::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonSettingsFile::new(dir.path().join("nested").join("settings.json"));

        let mut values = BTreeMap::new();
        values.insert("1_pingInterval".to_string(), 100);
        values.insert("3_gainIndex".to_string(), 4);
        store.save(&values).unwrap();

        assert_eq!(store.load().unwrap(), values);
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonSettingsFile::new(&path);
        assert!(matches!(store.load(), Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let store = MemoryStore::default();
        let mut writer = store.clone();
        let mut values = BTreeMap::new();
        values.insert("2_automaticMode".to_string(), 0);
        writer.save(&values).unwrap();
        assert_eq!(store.load().unwrap(), values);
    }
}
