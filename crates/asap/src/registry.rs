//! Format → engine registry.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::info;

use asap_core::{PeerId, MANAGEMENT_FORMAT};
use asap_store::escape_uri;
use asap_sync::{ChannelCreatedListener, EngineConfig, SyncEngine};

use crate::config::StorageRoot;
use crate::error::Result;

/// Opens one [`SyncEngine`] per format on first use and keeps it.
pub struct EngineRegistry {
    owner: PeerId,
    storage: StorageRoot,
    config: EngineConfig,
    engines: RwLock<BTreeMap<String, Arc<SyncEngine>>>,
    /// Attached to every application engine.
    channel_created: OnceLock<Arc<dyn ChannelCreatedListener>>,
}

impl EngineRegistry {
    pub fn new(owner: PeerId, storage: StorageRoot, config: EngineConfig) -> Self {
        Self {
            owner,
            storage,
            config,
            engines: RwLock::new(BTreeMap::new()),
            channel_created: OnceLock::new(),
        }
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    /// Attach `listener` to every application engine, present and future.
    ///
    /// Only the first call has an effect.
    pub fn set_channel_created_listener(&self, listener: Arc<dyn ChannelCreatedListener>) {
        if self.channel_created.set(listener.clone()).is_err() {
            return;
        }
        for (format, engine) in self.read().iter() {
            if format != MANAGEMENT_FORMAT {
                engine.attach_channel_created_listener(listener.clone());
            }
        }
    }

    pub fn get(&self, format: &str) -> Option<Arc<SyncEngine>> {
        self.read().get(format).cloned()
    }

    /// The engine of `format`, opened if needed.
    pub fn get_or_create(&self, format: &str) -> Result<Arc<SyncEngine>> {
        if let Some(engine) = self.get(format) {
            return Ok(engine);
        }

        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = engines.get(format) {
            return Ok(engine.clone());
        }

        let engine = Arc::new(self.open(format)?);
        if format != MANAGEMENT_FORMAT {
            if let Some(listener) = self.channel_created.get() {
                engine.attach_channel_created_listener(listener.clone());
            }
        }
        engines.insert(format.to_string(), engine.clone());
        info!(owner = %self.owner, format, "registered engine");
        Ok(engine)
    }

    fn open(&self, format: &str) -> Result<SyncEngine> {
        let engine = match &self.storage {
            StorageRoot::Fs(root) => SyncEngine::open_fs(
                self.owner.clone(),
                format,
                root.join(escape_uri(format)),
                self.config.clone(),
            )?,
            StorageRoot::Memory => {
                SyncEngine::in_memory_with(self.owner.clone(), format, self.config.clone())?
            }
        };
        Ok(engine)
    }

    /// Registered formats, sorted.
    pub fn formats(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Registered engines, sorted by format.
    pub fn engines(&self) -> Vec<Arc<SyncEngine>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<SyncEngine>>> {
        self.engines.read().unwrap_or_else(PoisonError::into_inner)
    }
}
