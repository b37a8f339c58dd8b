//! Era-aware chunk storage and multi-era chunk chains.

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use asap_core::{Era, EraRange, CHUNK_CHAIN_LOOKBACK};

use crate::chunk::{Chunk, ChunkMeta, Messages};
use crate::error::{Result, StoreError};
use crate::memory::MemoryChunkStore;
use crate::traits::ChunkStore;

/// All chunks of one origin, partitioned by era.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct ChunkStorage {
    store: Arc<dyn ChunkStore>,
}

impl ChunkStorage {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }

    /// Storage over a fresh [`MemoryChunkStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryChunkStore::new()))
    }

    /// Fetch the chunk for `(uri, era)`, creating an empty public one if absent.
    pub fn get_chunk(&self, uri: &str, era: Era) -> Result<Chunk> {
        if let Some(meta) = self.store.read_meta(uri, era)? {
            return Ok(Chunk::new(self.store.clone(), meta));
        }
        let meta = self.store.create_meta(ChunkMeta::new(uri, era))?;
        debug!(uri, %era, "created chunk");
        Ok(Chunk::new(self.store.clone(), meta))
    }

    /// Fetch the chunk for `(uri, era)` without creating it.
    pub fn existing_chunk(&self, uri: &str, era: Era) -> Result<Option<Chunk>> {
        Ok(self
            .store
            .read_meta(uri, era)?
            .map(|meta| Chunk::new(self.store.clone(), meta)))
    }

    pub fn exists_chunk(&self, uri: &str, era: Era) -> Result<bool> {
        self.store.has_chunk(uri, era)
    }

    /// Every chunk created in `era`, ordered by URI.
    pub fn get_chunks(&self, era: Era) -> Result<Vec<Chunk>> {
        let mut uris = self.store.list_uris(era)?;
        uris.sort();
        let mut chunks = Vec::with_capacity(uris.len());
        for uri in uris {
            if let Some(chunk) = self.existing_chunk(&uri, era)? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// Remove every chunk of `era`. Succeeds on an empty era.
    pub fn drop_chunks(&self, era: Era) -> Result<()> {
        debug!(%era, "dropping chunks");
        self.store.remove_era(era)
    }

    /// Lazy view of channel `uri` over the eras up to and including `to_era`.
    pub fn chunk_chain(&self, uri: &str, to_era: Era) -> ChunkChain {
        ChunkChain {
            storage: self.clone(),
            uri: uri.to_string(),
            from: to_era.back(CHUNK_CHAIN_LOOKBACK),
            to: to_era,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }
}

impl std::fmt::Debug for ChunkStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStorage").finish_non_exhaustive()
    }
}

/// The chunks of one channel across a range of eras, oldest first.
///
/// Nothing is read until iterated; eras without a chunk are skipped.
#[derive(Debug, Clone)]
pub struct ChunkChain {
    storage: ChunkStorage,
    uri: String,
    from: Era,
    to: Era,
}

impl ChunkChain {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn from_era(&self) -> Era {
        self.from
    }

    pub fn to_era(&self) -> Era {
        self.to
    }

    pub fn chunks(&self) -> ChainChunks<'_> {
        ChainChunks {
            chain: self,
            eras: self.from.through(self.to),
        }
    }

    /// All messages of the chain in chronological order.
    pub fn messages(&self) -> ChainMessages<'_> {
        ChainMessages {
            chunks: self.chunks(),
            current: None,
        }
    }

    /// Total number of messages.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for chunk in self.chunks() {
            total += chunk?.message_count();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Message at `position`, counted from the oldest when `chronological`
    /// and from the newest otherwise.
    pub fn message(&self, position: usize, chronological: bool) -> Result<Bytes> {
        let total = self.len()?;
        if position >= total {
            return Err(StoreError::NotFound(format!(
                "message {position} of {} ({total} messages)",
                self.uri
            )));
        }
        let index = if chronological {
            position
        } else {
            total - 1 - position
        };

        let mut skipped = 0;
        for chunk in self.chunks() {
            let chunk = chunk?;
            let count = chunk.message_count();
            if index < skipped + count {
                return chunk.messages()?.nth(index - skipped).ok_or_else(|| {
                    StoreError::InvalidData(format!("chunk {} lost a message", chunk.uri()))
                });
            }
            skipped += count;
        }
        Err(StoreError::NotFound(format!(
            "message {position} of {}",
            self.uri
        )))
    }
}

/// Iterator over the chunks of a [`ChunkChain`].
pub struct ChainChunks<'a> {
    chain: &'a ChunkChain,
    eras: EraRange,
}

impl Iterator for ChainChunks<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        for era in self.eras.by_ref() {
            match self.chain.storage.existing_chunk(&self.chain.uri, era) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Iterator over the messages of a [`ChunkChain`].
pub struct ChainMessages<'a> {
    chunks: ChainChunks<'a>,
    current: Option<Messages>,
}

impl Iterator for ChainMessages<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.current.as_mut().and_then(Iterator::next) {
                return Some(Ok(message));
            }
            match self.chunks.next()? {
                Ok(chunk) => match chunk.messages() {
                    Ok(messages) => self.current = Some(messages),
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
