//! Engine checkpoints.
//!
//! The engine saves an [`EngineSnapshot`] at well-defined points (era
//! rotation, before a send loop, after each era sent) and restores it when
//! reopened.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use asap_core::{Era, PeerId};

use crate::error::{Result, SyncError};

/// File name of a filesystem checkpoint inside an engine root.
pub const MEMENTO_FILE: &str = "asap.memento.json";

/// Persisted engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub owner: PeerId,
    pub format: String,
    pub era: Era,
    pub oldest_era: Era,
    pub last_seen: BTreeMap<PeerId, Era>,
    pub content_changed: bool,
    pub drop_delivered_chunks: bool,
    pub send_received_chunks: bool,
}

/// Pluggable checkpoint sink.
pub trait Memento: Send + Sync {
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;

    /// Last saved snapshot, if any.
    fn load(&self) -> Result<Option<EngineSnapshot>>;
}

/// Checkpoint stored as a JSON file, replaced atomically on save.
pub struct FsMemento {
    path: PathBuf,
}

impl FsMemento {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint at [`MEMENTO_FILE`] inside `root`.
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        Self::new(root.as_ref().join(MEMENTO_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checkpoint_io(path: &Path, e: io::Error) -> SyncError {
    SyncError::Checkpoint(format!("{}: {e}", path.display()))
}

impl Memento for FsMemento {
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| checkpoint_io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| checkpoint_io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| checkpoint_io(&self.path, e))
    }

    fn load(&self) -> Result<Option<EngineSnapshot>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(checkpoint_io(&self.path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SyncError::Checkpoint(format!("{}: {e}", self.path.display())))
    }
}

/// In-memory checkpoint for tests. Counts saves.
#[derive(Default)]
pub struct MemoryMemento {
    snapshot: Mutex<Option<EngineSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryMemento {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<EngineSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Memento for MemoryMemento {
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<EngineSnapshot>> {
        Ok(self.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot() -> EngineSnapshot {
        EngineSnapshot {
            owner: PeerId::from("alice"),
            format: "chat".into(),
            era: Era::new(4),
            oldest_era: Era::ZERO,
            last_seen: [(PeerId::from("bob"), Era::new(3))].into_iter().collect(),
            content_changed: true,
            drop_delivered_chunks: false,
            send_received_chunks: true,
        }
    }

    #[test]
    fn test_fs_memento_roundtrip() {
        let dir = TempDir::new().unwrap();
        let memento = FsMemento::in_dir(dir.path().join("engine"));
        assert!(memento.load().unwrap().is_none());

        memento.save(&snapshot()).unwrap();
        assert_eq!(memento.load().unwrap(), Some(snapshot()));
        assert!(!memento.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_fs_memento_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let memento = FsMemento::in_dir(dir.path());
        fs::write(memento.path(), b"{not json").unwrap();
        assert!(matches!(memento.load(), Err(SyncError::Checkpoint(_))));
    }

    #[test]
    fn test_memory_memento_counts() {
        let memento = MemoryMemento::new();
        memento.save(&snapshot()).unwrap();
        memento.save(&snapshot()).unwrap();
        assert_eq!(memento.save_count(), 2);
        assert_eq!(memento.load().unwrap(), Some(snapshot()));
    }
}
