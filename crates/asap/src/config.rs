//! Multi engine configuration.

use std::path::PathBuf;

use asap_core::{PeerId, ANONYMOUS_OWNER};
use asap_sync::EngineConfig;

/// Where engines keep their data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    /// One subdirectory per format below this directory.
    Fs(PathBuf),
    /// Nothing persisted.
    Memory,
}

/// Configuration for a [`crate::MultiEngine`].
#[derive(Debug, Clone)]
pub struct MultiEngineConfig {
    /// Identity of the local peer.
    pub owner: PeerId,
    pub storage: StorageRoot,
    /// Formats to open at start. Others are opened on demand.
    pub formats: Vec<String>,
    /// Run the management engine and propagate channel creation.
    pub management: bool,
    /// Configuration of every engine.
    pub engine: EngineConfig,
}

impl MultiEngineConfig {
    pub fn new(owner: PeerId) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageRoot) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_fs_root(self, root: impl Into<PathBuf>) -> Self {
        self.with_storage(StorageRoot::Fs(root.into()))
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.formats.push(format.into());
        self
    }

    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats.extend(formats.into_iter().map(Into::into));
        self
    }

    pub fn with_management(mut self, on: bool) -> Self {
        self.management = on;
        self
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

impl Default for MultiEngineConfig {
    fn default() -> Self {
        Self {
            owner: PeerId::from(ANONYMOUS_OWNER),
            storage: StorageRoot::Memory,
            formats: Vec::new(),
            management: true,
            engine: EngineConfig::default(),
        }
    }
}
