//! In-memory implementation of the ChunkStore trait.
//!
//! This is primarily for testing. It has the same semantics as the
//! filesystem store but keeps everything in memory with no persistence.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use asap_core::{Era, PeerId};

use crate::chunk::ChunkMeta;
use crate::error::Result;
use crate::storage::ChunkStorage;
use crate::traits::{ChunkStore, StorageProvider};

/// In-memory chunk store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryChunkStore {
    /// Era -> uri -> entry.
    eras: RwLock<HashMap<Era, BTreeMap<String, Entry>>>,
    updates: Mutex<()>,
}

#[derive(Default)]
struct Entry {
    meta: Option<ChunkMeta>,
    content: Vec<u8>,
}

impl MemoryChunkStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            eras: RwLock::new(HashMap::new()),
            updates: Mutex::new(()),
        }
    }

    /// Number of eras currently holding data.
    pub fn era_count(&self) -> usize {
        self.eras
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn read_meta(&self, uri: &str, era: Era) -> Result<Option<ChunkMeta>> {
        let eras = self.eras.read().unwrap_or_else(PoisonError::into_inner);
        Ok(eras
            .get(&era)
            .and_then(|chunks| chunks.get(uri))
            .and_then(|entry| entry.meta.clone()))
    }

    fn update_lock(&self) -> &Mutex<()> {
        &self.updates
    }

    fn write_meta(&self, meta: &ChunkMeta) -> Result<()> {
        let mut eras = self.eras.write().unwrap_or_else(PoisonError::into_inner);
        eras.entry(meta.era)
            .or_default()
            .entry(meta.uri.clone())
            .or_default()
            .meta = Some(meta.clone());
        Ok(())
    }

    fn write_content(&self, uri: &str, era: Era, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut eras = self.eras.write().unwrap_or_else(PoisonError::into_inner);
        let entry = eras
            .entry(era)
            .or_default()
            .entry(uri.to_string())
            .or_default();
        entry.content.resize(offset as usize, 0);
        entry.content.extend_from_slice(bytes);
        Ok(())
    }

    fn read_content(&self, uri: &str, era: Era) -> Result<Bytes> {
        let eras = self.eras.read().unwrap_or_else(PoisonError::into_inner);
        Ok(eras
            .get(&era)
            .and_then(|chunks| chunks.get(uri))
            .map(|entry| Bytes::copy_from_slice(&entry.content))
            .unwrap_or_default())
    }

    fn remove_chunk(&self, uri: &str, era: Era) -> Result<()> {
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        let mut eras = self.eras.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(chunks) = eras.get_mut(&era) {
            chunks.remove(uri);
            if chunks.is_empty() {
                eras.remove(&era);
            }
        }
        Ok(())
    }

    fn list_uris(&self, era: Era) -> Result<Vec<String>> {
        let eras = self.eras.read().unwrap_or_else(PoisonError::into_inner);
        Ok(eras
            .get(&era)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|(_, entry)| entry.meta.is_some())
                    .map(|(uri, _)| uri.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_era(&self, era: Era) -> Result<()> {
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        self.eras
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&era);
        Ok(())
    }
}

/// In-memory storage provider: one local store, one store per sender.
pub struct MemoryStorageProvider {
    local: ChunkStorage,
    incoming: RwLock<BTreeMap<PeerId, ChunkStorage>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self {
            local: ChunkStorage::new(Arc::new(MemoryChunkStore::new())),
            incoming: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn local(&self) -> Result<ChunkStorage> {
        Ok(self.local.clone())
    }

    fn incoming(&self, sender: &PeerId) -> Result<ChunkStorage> {
        let mut incoming = self.incoming.write().unwrap_or_else(PoisonError::into_inner);
        Ok(incoming
            .entry(sender.clone())
            .or_insert_with(ChunkStorage::in_memory)
            .clone())
    }

    fn senders(&self) -> Result<Vec<PeerId>> {
        let incoming = self.incoming.read().unwrap_or_else(PoisonError::into_inner);
        Ok(incoming.keys().cloned().collect())
    }
}
