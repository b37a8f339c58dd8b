//! Error types for the sync module.

use thiserror::Error;

use asap_core::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Engine construction or configuration failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer violated the exchange protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An exchange with this peer is already in progress.
    #[error("exchange with {peer} already in progress")]
    PermissionDenied { peer: PeerId },

    /// Channel or position not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] asap_store::StoreError),

    /// Invalid primitive value.
    #[error("core error: {0}")]
    Core(#[from] asap_core::CoreError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Saving or loading the engine checkpoint failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
