//! Protocol-wide constants.

/// Owner used when an engine is opened without an explicit identity.
pub const ANONYMOUS_OWNER: &str = "anon";

/// Reserved application format carrying channel-creation messages.
pub const MANAGEMENT_FORMAT: &str = "asap/management";

/// Prefix of the locally generated management channel URIs.
pub const MANAGEMENT_URI_PREFIX: &str = "sn2://asapManagement://";

/// Number of predecessor eras a chunk chain looks back from its end era.
pub const CHUNK_CHAIN_LOOKBACK: u32 = 1000;
