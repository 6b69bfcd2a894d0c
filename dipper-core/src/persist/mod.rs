//! State persistence
//!
//! One session directory per run. Every JSON state file is replaced
//! atomically (`write tmp -> rename`) so a crash can never leave a
//! half-written file; the event log and PnL ledger are append-only JSONL.

pub mod events;

pub use events::{Event, EventLog, EventRecord};

use crate::core::errors::PersistError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Canonical layout of a session directory.
#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub root: PathBuf,
}

impl SessionDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree; idempotent.
    pub fn ensure(&self) -> Result<(), PersistError> {
        for dir in [self.root.clone(), self.logs_dir()] {
            fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn anchors_file(&self) -> PathBuf {
        self.root.join("anchors.json")
    }

    pub fn positions_file(&self) -> PathBuf {
        self.root.join("positions.json")
    }

    pub fn open_buy_orders_file(&self) -> PathBuf {
        self.root.join("open_buy_orders.json")
    }

    pub fn pnl_ledger_file(&self) -> PathBuf {
        self.root.join("pnl_ledger.jsonl")
    }

    pub fn events_file(&self) -> PathBuf {
        self.logs_dir().join("events.jsonl")
    }
}

/// Serialize `value` to `path` via a temp file and atomic rename.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).map_err(|source| PersistError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| PersistError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

/// Load JSON state; `Ok(None)` when the file does not exist yet.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PersistError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_atomic_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut value = HashMap::new();
        value.insert("BTC/USDT".to_string(), 42u64);
        atomic_write_json(&path, &value).unwrap();

        let loaded: Option<HashMap<String, u64>> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap().get("BTC/USDT"), Some(&42));
        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<HashMap<String, u64>> =
            load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{not json").unwrap();
        let result: Result<Option<HashMap<String, u64>>, _> = load_json(&path);
        assert!(matches!(result, Err(PersistError::Corrupt { .. })));
    }

    #[test]
    fn test_session_dirs_ensure() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(dir.path().join("session"));
        dirs.ensure().unwrap();
        assert!(dirs.logs_dir().is_dir());
    }
}
