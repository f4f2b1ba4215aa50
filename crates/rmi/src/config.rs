//! # Configuration
//!
//! Per-peer settings, fixed when the peer is built.

/// Default nesting limit for values carried in one message.
pub const DEFAULT_MAX_DEPTH: usize = rmiwire::MAX_RECURSION_DEPTH;

/// Default size limit for a single encoded message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Identifies this peer in namespace ids and diagnostics.
    pub peer_id: String,
    /// Maximum nesting of values, enforced when encoding and decoding.
    pub max_depth: usize,
    /// Maximum encoded size of one message, in bytes.
    pub max_message_size: usize,
}

impl Config {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
