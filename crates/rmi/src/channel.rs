//! # Channel Abstraction
//!
//! A minimal, async interface for moving messages between two peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A channel knows nothing about frames or values. It moves
//!   opaque buffers.
//! - **Ordered and Reliable**: Delivery order and loss are the channel's contract.
//!   Nothing above it retries, reorders or times out.
//! - **One Reader**: `recv` is driven by exactly one dispatch loop per peer.

use std::fmt;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is unreachable or the channel was closed.
    ConnectionLost(String),
    /// The message exceeds the configured size limit.
    PayloadTooLarge { size: usize, limit: usize },
    /// Generic I/O error or internal channel failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "Payload of {} bytes exceeds the limit of {}", size, limit)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A duplex message channel to exactly one peer.
///
/// This trait is object-safe (`Box<dyn Channel>`).
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, message: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the channel is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// An in-process channel built on tokio mpsc queues.
///
/// Messages sent on one end appear on the other end's `recv`, in order.
pub struct LocalChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LocalChannel {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self { tx: tx_a, rx: Mutex::new(rx_b) };
        let b = Self { tx: tx_b, rx: Mutex::new(rx_a) };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Channel for LocalChannel {
    async fn send(&self, message: &[u8]) -> Result<()> {
        self.tx
            .send(message.to_vec())
            .map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
