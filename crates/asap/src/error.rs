//! Error types for the multi engine.

use std::collections::BTreeSet;

use asap_core::PeerId;
use asap_store::StoreError;
use asap_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during multi engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// No engine serves this format.
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    /// Management message could not be decoded.
    #[error("malformed management message: {0}")]
    MalformedManagementMessage(String),

    /// Management message disagrees with an existing channel.
    #[error("channel {uri} exists with members {existing:?}, message names {received:?}")]
    InconsistentChannel {
        uri: String,
        existing: BTreeSet<PeerId>,
        received: BTreeSet<PeerId>,
    },
}

/// Result type for multi engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
