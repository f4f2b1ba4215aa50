//! # Peer Builder
//!
//! Provides a fluent API for configuring a peer before it starts reading its channel.

use crate::Rmi;
use crate::channel::Channel;
use crate::config::Config;

/// Fluent builder for an `Rmi` peer.
pub struct RmiBuilder {
    config: Config,
}

impl RmiBuilder {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self { config: Config::new(peer_id) }
    }

    /// Maximum nesting of values in one message.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Maximum encoded size of one message, in bytes.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the peer on `channel`. Must be called within a tokio runtime.
    pub fn build(self, channel: impl Channel) -> Rmi {
        Rmi::start(self.config, Box::new(channel))
    }
}
