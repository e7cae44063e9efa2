//! File-backed state manager for local development
//!
//! Stores all positions in a single JSON file mapping `"type:id"` keys to
//! tokens. Every write rewrites the whole file through a temporary file and
//! an atomic rename, so a crash mid-write leaves the previous state intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::config::env_or;
use crate::error::{CdcError, Result};
use crate::types::Position;

use super::StateManager;

pub struct FileStateManager {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateManager {
    /// Build from `STATE_FILE_PATH` (default `./data/state.json`).
    pub fn from_env() -> Result<Self> {
        Self::new(PathBuf::from(env_or("STATE_FILE_PATH", "./data/state.json")))
    }

    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CdcError::Configuration(format!(
                    "Cannot create state directory {:?}: {}",
                    parent, e
                ))
            })?;
        }
        Ok(FileStateManager {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self) -> std::io::Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> std::io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

fn state_key(datasource_type: &str, datasource_source: &str) -> String {
    format!("{}:{}", datasource_type, datasource_source)
}

impl StateManager for FileStateManager {
    fn store(&self, datasource_type: &str, datasource_source: &str, position: &Position) -> bool {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Failed to load state file {:?}: {}", self.path, e);
                return false;
            }
        };
        entries.insert(
            state_key(datasource_type, datasource_source),
            position.as_str().to_string(),
        );

        match self.save(&entries) {
            Ok(()) => {
                log::info!(
                    "State stored for {}:{} - {}",
                    datasource_type,
                    datasource_source,
                    position
                );
                true
            }
            Err(e) => {
                log::error!("Failed to write state file {:?}: {}", self.path, e);
                false
            }
        }
    }

    fn read(&self, datasource_type: &str, datasource_source: &str) -> Position {
        match self.load() {
            Ok(entries) => entries
                .get(&state_key(datasource_type, datasource_source))
                .map(Position::new)
                .unwrap_or_else(Position::empty),
            Err(e) => {
                log::error!("Failed to read state file {:?}: {}", self.path, e);
                Position::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_missing_returns_empty() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("state.json")).unwrap();
        assert!(manager.read("mysql", "db1").is_empty());
    }

    #[test]
    fn test_store_then_read() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("state.json")).unwrap();

        assert!(manager.store("mysql", "db1", &Position::new("uuid:7")));
        assert_eq!(manager.read("mysql", "db1"), Position::new("uuid:7"));
    }

    #[test]
    fn test_store_overwrites() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("state.json")).unwrap();

        assert!(manager.store("mysql", "db1", &Position::new("uuid:7")));
        assert!(manager.store("mysql", "db1", &Position::new("uuid:9")));
        assert_eq!(manager.read("mysql", "db1"), Position::new("uuid:9"));
    }

    #[test]
    fn test_keys_are_independent() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("state.json")).unwrap();

        assert!(manager.store("mysql", "db1", &Position::new("uuid:1")));
        assert!(manager.store("mysql", "db2", &Position::new("uuid:2")));
        assert_eq!(manager.read("mysql", "db1"), Position::new("uuid:1"));
        assert_eq!(manager.read("mysql", "db2"), Position::new("uuid:2"));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let manager = FileStateManager::new(path.clone()).unwrap();
            assert!(manager.store("mysql", "db1", &Position::new("uuid:3")));
        }
        let reopened = FileStateManager::new(path).unwrap();
        assert_eq!(reopened.read("mysql", "db1"), Position::new("uuid:3"));
    }

    #[test]
    fn test_corrupt_file_reads_empty_and_fails_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        let manager = FileStateManager::new(path).unwrap();
        assert!(manager.read("mysql", "db1").is_empty());
        assert!(!manager.store("mysql", "db1", &Position::new("uuid:1")));
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/state.json");
        let manager = FileStateManager::new(nested).unwrap();
        assert!(manager.store("mysql", "db1", &Position::new("uuid:1")));
    }
}
