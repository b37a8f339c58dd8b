//! Store traits: the abstract interface for chunk persistence.
//!
//! A [`ChunkStore`] persists two things per `(uri, era)` key: a metadata
//! record and a content byte stream. Chunk semantics (offsets, delivery
//! bookkeeping, cloning) live in [`crate::Chunk`], so backends stay small.

use bytes::Bytes;
use std::sync::{Mutex, PoisonError};

use asap_core::{Era, PeerId};

use crate::chunk::ChunkMeta;
use crate::error::{Result, StoreError};
use crate::storage::ChunkStorage;

/// Persistence primitives for chunks of one origin.
///
/// Implementations must be thread-safe (Send + Sync). Missing keys are never
/// an error for reads: they yield `None`, empty content or an empty list.
///
/// Metadata changes go through [`ChunkStore::update_meta`], which re-reads the
/// stored record under [`ChunkStore::update_lock`]. Removals take the same
/// lock, so an update never resurrects a removed chunk.
pub trait ChunkStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the metadata record of a chunk.
    fn read_meta(&self, uri: &str, era: Era) -> Result<Option<ChunkMeta>>;

    /// Persist (create or replace) the metadata record of a chunk.
    fn write_meta(&self, meta: &ChunkMeta) -> Result<()>;

    /// Check whether a chunk has been created.
    fn has_chunk(&self, uri: &str, era: Era) -> Result<bool> {
        Ok(self.read_meta(uri, era)?.is_some())
    }

    /// Lock serializing metadata read-modify-write cycles and removals.
    fn update_lock(&self) -> &Mutex<()>;

    /// Persist `meta` unless the chunk already exists. Returns the stored
    /// record either way.
    fn create_meta(&self, meta: ChunkMeta) -> Result<ChunkMeta> {
        let _guard = self.update_lock().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.read_meta(&meta.uri, meta.era)? {
            return Ok(existing);
        }
        self.write_meta(&meta)?;
        Ok(meta)
    }

    /// Apply `update` to the current stored metadata and persist the result.
    ///
    /// `update` may write content; it must not call back into `update_meta`.
    /// Fails with [`StoreError::NotFound`] when the chunk does not exist.
    fn update_meta(
        &self,
        uri: &str,
        era: Era,
        update: &mut dyn FnMut(&mut ChunkMeta) -> Result<()>,
    ) -> Result<ChunkMeta> {
        let _guard = self.update_lock().lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self
            .read_meta(uri, era)?
            .ok_or_else(|| StoreError::NotFound(format!("chunk {uri} in era {era}")))?;
        update(&mut meta)?;
        self.write_meta(&meta)?;
        Ok(meta)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Write `bytes` at `offset`, discarding anything stored past `offset`.
    ///
    /// Appending passes the recorded chunk length as offset; replacing the
    /// whole content passes zero.
    fn write_content(&self, uri: &str, era: Era, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Read the stored content of a chunk (empty if none was written).
    fn read_content(&self, uri: &str, era: Era) -> Result<Bytes>;

    // ─────────────────────────────────────────────────────────────────────────
    // Removal and listing
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove metadata and content of one chunk. Takes the update lock.
    fn remove_chunk(&self, uri: &str, era: Era) -> Result<()>;

    /// URIs of all chunks created in an era.
    fn list_uris(&self, era: Era) -> Result<Vec<String>>;

    /// Remove every chunk of an era. Succeeds if the era holds nothing.
    /// Takes the update lock.
    fn remove_era(&self, era: Era) -> Result<()>;
}

/// Source of the chunk storages an engine works with.
///
/// One local storage for the engine's own channels and one incoming storage
/// per remote sender, created on first contact and kept afterwards.
pub trait StorageProvider: Send + Sync {
    /// Storage for locally written channels.
    fn local(&self) -> Result<ChunkStorage>;

    /// Storage for data received from `sender`.
    fn incoming(&self, sender: &PeerId) -> Result<ChunkStorage>;

    /// Senders an incoming storage exists for.
    fn senders(&self) -> Result<Vec<PeerId>>;
}
