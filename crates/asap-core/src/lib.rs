//! # ASAP Core
//!
//! Pure primitives for the ASAP store-and-forward sync engine.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Era`] - Circular logical time unit. Eras are ordered only by the
//!   successor relation, never by magnitude.
//! - [`EraRange`] - Inclusive walk between two eras along the circle
//! - [`PeerId`] - Identity of a peer (opaque string)
//!
//! ## Constants
//!
//! Protocol-wide names live in [`constants`].

pub mod constants;
pub mod era;
pub mod error;
pub mod peer;

pub use constants::{
    ANONYMOUS_OWNER, CHUNK_CHAIN_LOOKBACK, MANAGEMENT_FORMAT, MANAGEMENT_URI_PREFIX,
};
pub use era::{Era, EraRange};
pub use error::{CoreError, Result};
pub use peer::{validate_format, PeerId};
