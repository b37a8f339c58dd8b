//! Error types for ASAP core primitives.

use thiserror::Error;

/// Errors raised while constructing or parsing core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid era: {0}")]
    InvalidEra(String),

    #[error("peer identity must not be empty")]
    EmptyPeerId,

    #[error("format expected, like application/x-sn2-makan")]
    MissingFormat,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
