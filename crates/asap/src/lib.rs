//! # ASAP
//!
//! Delay-tolerant store-and-forward messaging for peers that meet only
//! occasionally.
//!
//! ## Overview
//!
//! Applications write messages into channels identified by URIs. Messages are
//! grouped into eras; whenever two peers meet they exchange every chunk of
//! the eras the other side has not seen yet. Peers may relay what they
//! received, so data travels further than any single encounter.
//!
//! - **Channels**: public (anyone may receive) or closed (members only)
//! - **Eras**: circular logical clock; rotated when new content exists
//! - **Formats**: each application format gets its own engine and storage
//! - **Management**: channel creation is announced to the members over a
//!   reserved format, so recipients learn about channels before data arrives
//!
//! ## Usage
//!
//! ```rust,no_run
//! use asap::{MultiEngine, MultiEngineConfig};
//! use asap::core::PeerId;
//! use asap::sync::transport::memory;
//!
//! async fn example() -> asap::Result<()> {
//!     let alice = MultiEngine::new(
//!         MultiEngineConfig::new(PeerId::from("alice"))
//!             .with_fs_root("/var/lib/asap/alice")
//!             .with_format("chat"),
//!     )?;
//!     let bob = MultiEngine::new(MultiEngineConfig::new(PeerId::from("bob")).with_format("chat"))?;
//!
//!     let chat = alice.engine("chat")?;
//!     chat.create_channel_for("sn2://c1", PeerId::from("bob"))?;
//!     chat.add("sn2://c1", b"hello")?;
//!
//!     let (a, b) = memory::pair();
//!     let (ra, rb) = tokio::join!(alice.handle_connection(&a), bob.handle_connection(&b));
//!     ra?;
//!     rb?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `asap::core` - Eras, peer identities, constants
//! - `asap::store` - Chunk storage
//! - `asap::sync` - Single-format engine and protocol

pub mod config;
pub mod error;
pub mod management;
pub mod multi;
pub mod registry;

// Re-export component crates
pub use asap_core as core;
pub use asap_store as store;
pub use asap_sync as sync;

// Re-export main types for convenience
pub use config::{MultiEngineConfig, StorageRoot};
pub use error::{EngineError, Result};
pub use management::{ManagementHandler, ManagementMessage};
pub use multi::{MultiEngine, OnlinePeersListener};
pub use registry::EngineRegistry;

// Re-export commonly used types
pub use asap_core::{Era, PeerId};
pub use asap_sync::{EngineConfig, SyncEngine, SyncReport};
