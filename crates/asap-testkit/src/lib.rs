//! # ASAP Testkit
//!
//! Testing utilities for ASAP sync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: peers over in-memory or temporary on-disk storage, and a
//!   helper that runs one exchange between two of them
//! - **Generators**: Proptest strategies for eras, identities and messages
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use asap_testkit::fixtures::{exchange, TestPeer};
//!
//! async fn example() {
//!     let alice = TestPeer::memory("alice", &["chat"]);
//!     let bob = TestPeer::memory("bob", &["chat"]);
//!     alice.chat().add("sn2://news", b"hello").unwrap();
//!     let (sent, received) = exchange(&alice, &bob).await;
//!     assert_eq!(sent.chunks_sent, received.chunks_received);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use asap_testkit::generators::messages;
//!
//! proptest! {
//!     #[test]
//!     fn chunk_keeps_messages(batch in messages(16, 64)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{exchange, exchange_engines, init_tracing, TestPeer};
