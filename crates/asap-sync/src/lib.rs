//! # ASAP Sync
//!
//! Store-and-forward synchronization between peers that meet only
//! occasionally.
//!
//! ## Overview
//!
//! A [`SyncEngine`] serves one application format. Local messages go into the
//! chunk of their channel in the current era. When two peers meet, each side
//! sends every chunk of the eras the other has not seen yet; the current era
//! is closed first so fresh content travels with the encounter.
//!
//! ## Key Properties
//!
//! - **At-least-once**: a peer's cursor moves only after a whole era was sent
//! - **Closed channels stay closed**: chunks with recipients only go to members
//! - **One exchange per peer**: a second concurrent exchange is refused
//! - **Checkpointed**: era clock and cursors survive restarts
//!
//! ## Usage
//!
//! ```rust,no_run
//! use asap_core::PeerId;
//! use asap_sync::{transport::memory, SyncEngine};
//!
//! async fn example() -> asap_sync::Result<()> {
//!     let alice = SyncEngine::in_memory(PeerId::from("alice"), "chat")?;
//!     let bob = SyncEngine::in_memory(PeerId::from("bob"), "chat")?;
//!     alice.create_channel_for("sn2://c1", PeerId::from("bob"))?;
//!     alice.add("sn2://c1", b"hello")?;
//!
//!     let (a, b) = memory::pair();
//!     let (ra, rb) = tokio::join!(alice.handle_connection(&a), bob.handle_connection(&b));
//!     println!("sent {}, received {}", ra?.chunks_sent, rb?.chunks_received);
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                              Peer B
//!   |-------- Interest --------------->|
//!   |<------- Interest ----------------|
//!   |-------- Assimilate* ------------>|
//!   |<------- Assimilate* -------------|
//!   |-------- (finish) --------------->|
//!   |<------- (finish) ----------------|
//! ```

pub mod engine;
pub mod error;
pub mod listener;
pub mod memento;
pub mod messages;
pub mod protocol;
pub mod transport;

pub use engine::{ActivePeerGuard, SyncEngine};
pub use error::{Result, SyncError};
pub use listener::{
    ChannelCreatedListener, ChunkReceivedListener, ListenerId, Listeners, MessageAddedListener,
};
pub use memento::{EngineSnapshot, FsMemento, Memento, MemoryMemento, MEMENTO_FILE};
pub use messages::{AssimilatePdu, InterestPdu, OfferPdu, Pdu};
pub use protocol::{EngineConfig, SyncReport};
pub use transport::{memory::MemoryConnection, stream::StreamConnection, Connection};
