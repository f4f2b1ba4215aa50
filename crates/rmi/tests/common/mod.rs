//! Shared fixtures for the end-to-end suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;

use rmi::Channel;
use rmi::LocalChannel;
use rmi::Rmi;
use rmiwire::Frame;
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two connected peers: `(server, client)`.
pub fn peers() -> (Rmi, Rmi) {
    init_tracing();
    let (a, b) = LocalChannel::pair();
    (Rmi::new("server", a), Rmi::new("client", b))
}

/// A peer whose other end is driven by hand.
pub fn scripted(peer_id: &str) -> (Rmi, LocalChannel) {
    init_tracing();
    let (a, b) = LocalChannel::pair();
    (Rmi::new(peer_id, a), b)
}

/// Reads and decodes the next frame from a hand-driven end.
pub async fn next_frame(end: &LocalChannel) -> anyhow::Result<Frame> {
    let bytes = end
        .recv()
        .await?
        .ok_or_else(|| anyhow::anyhow!("channel closed"))?;
    Ok(Frame::decode(&bytes, rmiwire::MAX_RECURSION_DEPTH)?)
}

/// Encodes and sends a frame from a hand-driven end.
pub async fn send_frame(end: &LocalChannel, frame: &Frame) -> anyhow::Result<()> {
    end.send(&frame.to_bytes(rmiwire::MAX_RECURSION_DEPTH)?).await?;
    Ok(())
}

/// A channel that keeps a copy of every message it sends.
pub struct Tap {
    inner: LocalChannel,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Tap {
    pub fn new(inner: LocalChannel) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (Self { inner, sent: sent.clone() }, sent)
    }
}

#[async_trait::async_trait]
impl Channel for Tap {
    async fn send(&self, message: &[u8]) -> rmi::channel::Result<()> {
        self.sent.lock().unwrap().push(message.to_vec());
        self.inner.send(message).await
    }

    async fn recv(&self) -> rmi::channel::Result<Option<Vec<u8>>> {
        self.inner.recv().await
    }
}

/// Decodes every message captured by a `Tap`.
pub fn tapped_frames(sent: &Mutex<Vec<Vec<u8>>>) -> Vec<Frame> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|bytes| Frame::decode(bytes, rmiwire::MAX_RECURSION_DEPTH).unwrap())
        .collect()
}
