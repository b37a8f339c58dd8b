//! # ASAP Store
//!
//! Chunk storage for the ASAP sync engine. Messages of one channel within one
//! era form a [`Chunk`]; a [`ChunkStorage`] holds all chunks of one origin
//! (local data, or data received from one sender) across all live eras.
//!
//! ## Overview
//!
//! Persistence is abstracted behind the [`ChunkStore`] trait, which only knows
//! about metadata records and content byte streams keyed by `(uri, era)`.
//! [`Chunk`] and [`ChunkStorage`] build the chunk semantics on top of it, so
//! every backend behaves the same.
//!
//! ## Key Types
//!
//! - [`ChunkStore`] - Persistence primitives
//! - [`FsChunkStore`] - One directory per era, a content and a metadata file per channel
//! - [`MemoryChunkStore`] - In-memory backend for tests
//! - [`ChunkStorage`] - Era-aware view: fetch-or-create, list, drop, chunk chains
//! - [`ChunkChain`] - Lazy multi-era view of one channel
//! - [`StorageProvider`] - Local storage plus one incoming storage per sender
//!
//! ## Usage
//!
//! ```rust
//! use asap_core::Era;
//! use asap_store::ChunkStorage;
//!
//! let storage = ChunkStorage::in_memory();
//! let mut chunk = storage.get_chunk("sn2://chat", Era::ZERO).unwrap();
//! chunk.add_message(b"hello").unwrap();
//!
//! let messages: Vec<_> = chunk.messages().unwrap().collect();
//! assert_eq!(&messages[0][..], b"hello");
//! ```
//!
//! ## Design Notes
//!
//! - **Write-through**: every chunk mutation is persisted before it returns.
//! - **Length is authoritative**: content past the recorded length (a torn
//!   append) is ignored on read and overwritten by the next append.
//! - **Lazy directories**: era directories appear on first write and vanish
//!   wholesale on [`ChunkStorage::drop_chunks`].

pub mod chunk;
pub mod error;
pub mod fs;
pub mod memory;
pub mod storage;
pub mod traits;

pub use chunk::{ChannelInfo, Chunk, ChunkMeta, Messages};
pub use error::{Result, StoreError};
pub use fs::{escape_uri, unescape_uri, FsChunkStore, FsStorageProvider};
pub use memory::{MemoryChunkStore, MemoryStorageProvider};
pub use storage::{ChainChunks, ChainMessages, ChunkChain, ChunkStorage};
pub use traits::{ChunkStore, StorageProvider};
