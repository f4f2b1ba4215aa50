//! # Message Adaptor
//!
//! Correlates requests with responses over one channel and dispatches incoming
//! requests to the namespace registry.
//!
//! ## Invariants
//! - **Single Pump**: One task reads the channel. Decoding, lookup, unmarshaling
//!   and settlement of a message finish before the next message is read.
//! - **Ordered Dispatch**: Handlers are called in the order their requests
//!   arrive, one at a time. Only awaiting the future a handler returns happens
//!   off the pump.
//! - **Exactly One Reply**: Every decodable request is answered once, with a
//!   response or an error, however its handler completes.
//! - **Isolated Failures**: A bad message fails the one call it belongs to. Stale
//!   or duplicate responses are logged, counted and dropped; the pump keeps going.
//! - **Closed Means Closed**: When the channel ends, every pending call fails with
//!   a transport error and no new call can start waiting.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use rmiwire::Body;
use rmiwire::Fault;
use rmiwire::Frame;
use rmiwire::Header;
use rmiwire::Kind;
use rmiwire::Val;
use rmiwire::decode_header;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::arg::Arg;
use crate::channel::Channel;
use crate::channel::TransportError;
use crate::class::Proxy;
use crate::config::Config;
use crate::error::Error;
use crate::error::ProtocolError;
use crate::error::Result;
use crate::error::SerializationError;
use crate::marshal;
use crate::metadata::MethodMetadata;
use crate::namespace::GLOBAL;
use crate::namespace::Method;
use crate::namespace::RELEASE;
use crate::namespace::Registry;
use crate::payload::Payload;

/// A call waiting for its response.
struct PendingCall {
    meta: Arc<MethodMetadata>,
    tx: oneshot::Sender<Result<Arg>>,
}

pub(crate) struct Inner {
    config: Config,
    channel: Box<dyn Channel>,
    registry: Registry,
    pending: DashMap<String, PendingCall>,
    seq: AtomicU64,
    faults: AtomicU64,
    closed: AtomicBool,
}

/// The protocol engine of one peer.
///
/// Cheap to clone; all clones share one channel, registry and pending table.
#[derive(Clone)]
pub struct Adaptor(Arc<Inner>);

/// A handle that does not keep the adaptor alive.
#[derive(Clone)]
pub(crate) struct WeakAdaptor(Weak<Inner>);

impl WeakAdaptor {
    pub fn upgrade(&self) -> Result<Adaptor> {
        self.0
            .upgrade()
            .map(Adaptor)
            .ok_or_else(|| TransportError::ConnectionLost("Adaptor shut down".into()).into())
    }
}

impl Adaptor {
    /// Creates the adaptor and spawns its pump task.
    pub(crate) fn spawn(config: Config, channel: Box<dyn Channel>) -> (Self, JoinHandle<()>) {
        let adaptor = Self(Arc::new(Inner {
            config,
            channel,
            registry: Registry::new(),
            pending: DashMap::new(),
            seq: AtomicU64::new(1),
            faults: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }));
        let pump = tokio::spawn(adaptor.clone().pump());
        (adaptor, pump)
    }

    pub fn peer_id(&self) -> &str {
        &self.0.config.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Number of calls sent and not yet settled.
    pub fn pending_calls(&self) -> usize {
        self.0.pending.len()
    }

    /// Number of protocol faults absorbed without failing a call.
    pub fn faults(&self) -> u64 {
        self.0.faults.load(Ordering::Relaxed)
    }

    /// Number of registered namespaces, the global one included.
    pub fn namespaces(&self) -> usize {
        self.0.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub(crate) fn downgrade(&self) -> WeakAdaptor {
        WeakAdaptor(Arc::downgrade(&self.0))
    }

    /// A namespace id not currently registered on this peer.
    pub(crate) fn new_namespace_id(&self) -> String {
        loop {
            let id = format!("{}:{:016x}", self.peer_id(), rand::random::<u64>());
            if !self.0.registry.contains(&id) {
                return id;
            }
        }
    }

    fn next_correlation_id(&self) -> String {
        self.0.seq.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn note_fault(&self) {
        self.0.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Sends a request and waits for its outcome.
    pub async fn call(&self, namespace: &str, meta: Arc<MethodMetadata>, args: Vec<Arg>) -> Result<Arg> {
        self.prepare(namespace, meta, args)?.send().await?.wait().await
    }

    /// Marshals and encodes a request without sending it.
    ///
    /// Callbacks among `args` are registered on behalf of `namespace`.
    pub(crate) fn prepare(&self, namespace: &str, meta: Arc<MethodMetadata>, args: Vec<Arg>) -> Result<Outgoing> {
        self.prepare_scoped(namespace, namespace, meta, args)
    }

    /// Like `prepare`, registering callbacks on behalf of `scope` instead.
    pub(crate) fn prepare_scoped(
        &self,
        namespace: &str,
        scope: &str,
        meta: Arc<MethodMetadata>,
        args: Vec<Arg>,
    ) -> Result<Outgoing> {
        let payload = Payload::new(args, namespace, meta.name());
        let marshaled = marshal::marshal_args(self, &payload, &meta, scope)?;

        let header = Header::new(self.next_correlation_id(), namespace, meta.name());
        let frame = Frame::request(header, marshaled.value);
        let bytes = self.encode_frame(&frame)?;

        Ok(Outgoing {
            adaptor: self.clone(),
            header: frame.header,
            meta,
            bytes,
            waits: marshaled.waits,
        })
    }

    /// Asks the peer to free its side of `namespace`.
    pub(crate) async fn release_remote(&self, namespace: &str) -> Result<bool> {
        let meta = Arc::new(MethodMetadata::new(RELEASE));
        let released = self.call(GLOBAL, meta, vec![Arg::from(namespace)]).await?;
        released.as_bool().ok_or_else(|| {
            ProtocolError::Malformed(format!("release answered with {}", released.kind())).into()
        })
    }

    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        let bytes = frame.to_bytes(self.0.config.max_depth).map_err(|e| SerializationError {
            namespace: frame.header.namespace.clone(),
            method: frame.header.method.clone(),
            position: None,
            reason: e.to_string(),
        })?;

        let limit = self.0.config.max_message_size;
        if bytes.len() > limit {
            return Err(TransportError::PayloadTooLarge { size: bytes.len(), limit }.into());
        }
        Ok(bytes)
    }

    async fn pump(self) {
        let peer = self.peer_id().to_owned();
        tracing::debug!(peer = %peer, "pump started");

        let error = loop {
            match self.0.channel.recv().await {
                Ok(Some(message)) => self.handle_message(&message),
                Ok(None) => {
                    tracing::debug!(peer = %peer, "channel closed");
                    break TransportError::ConnectionLost("Channel closed".into());
                }
                Err(e) => {
                    tracing::error!(peer = %peer, error = %e, "channel failed");
                    break e;
                }
            }
        };

        self.fail_pending(error);
    }

    /// Fails every pending call and refuses new ones.
    pub(crate) fn fail_pending(&self, error: TransportError) {
        self.0.closed.store(true, Ordering::SeqCst);
        let keys: Vec<String> = self.0.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, call)) = self.0.pending.remove(&key) {
                let _ = call.tx.send(Err(error.clone().into()));
            }
        }
    }

    fn handle_message(&self, message: &[u8]) {
        let limit = self.0.config.max_message_size;
        if message.len() > limit {
            let reason = format!("message of {} bytes exceeds the limit of {}", message.len(), limit);
            self.reject(message, reason);
            return;
        }

        let frame = match Frame::decode(message, self.0.config.max_depth) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(message, e.to_string());
                return;
            }
        };

        match frame.body {
            Body::Request { args } => self.dispatch(frame.header, args),
            Body::Response { result } => self.settle(frame.header, Ok(result)),
            Body::Error { fault } => self.settle(frame.header, Err(fault)),
        }
    }

    /// Routes an undecodable message to the call it belongs to, if that can be told.
    fn reject(&self, message: &[u8], reason: String) {
        self.note_fault();
        let error = ProtocolError::Malformed(reason);

        match decode_header(message) {
            Ok((Kind::Request, header)) => {
                tracing::warn!(peer = self.peer_id(), id = %header.id, error = %error, "rejecting request");
                self.spawn_fault(header, error.into());
            }
            Ok((_, header)) => {
                tracing::warn!(peer = self.peer_id(), id = %header.id, error = %error, "undecodable response");
                if let Some((_, call)) = self.0.pending.remove(&header.id) {
                    let _ = call.tx.send(Err(error.into()));
                }
            }
            Err(e) => {
                tracing::warn!(peer = self.peer_id(), error = %error, header = %e, "dropping message");
            }
        }
    }

    fn dispatch(&self, header: Header, args: Vec<Val>) {
        tracing::debug!(
            peer = self.peer_id(),
            id = %header.id,
            namespace = %header.namespace,
            method = %header.method,
            "dispatching request"
        );

        let method = match self.0.registry.resolve(&header.namespace, &header.method) {
            Ok(method) => method,
            Err(e) => {
                tracing::warn!(peer = self.peer_id(), id = %header.id, error = %e, "rejecting request");
                self.spawn_fault(header, e.into());
                return;
            }
        };

        let payload = Payload::new(args, header.namespace.clone(), header.method.clone());
        let args = match marshal::unmarshal_args(self, payload, &method.meta) {
            Ok(args) => args,
            Err(e) => {
                self.spawn_fault(header, e);
                return;
            }
        };

        let Method { meta, handler } = method;
        let panicked = {
            let name = meta.name().to_owned();
            move || -> Result<Arg> { Err(Error::raise(format!("method '{}' panicked", name))) }
        };

        // The handler is called inside the pump step; only its future is awaited elsewhere.
        let running = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(running) => running,
            Err(_) => futures::future::ready(panicked()).boxed(),
        };

        let adaptor = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(running).catch_unwind().await.unwrap_or_else(|_| panicked());
            adaptor.respond(header, &meta, outcome).await;
        });
    }

    fn settle(&self, header: Header, outcome: std::result::Result<Val, Fault>) {
        let Some((_, call)) = self.0.pending.remove(&header.id) else {
            self.note_fault();
            let error = ProtocolError::UnmatchedResponse(header.id);
            tracing::warn!(peer = self.peer_id(), error = %error, "dropping response");
            return;
        };

        let result = match outcome {
            Ok(result) => {
                let payload = Payload::new(result, header.namespace, header.method);
                marshal::unmarshal_return(self, payload, &call.meta)
            }
            Err(fault) => Err(Error::from_fault(fault)),
        };

        // The caller may have stopped waiting.
        let _ = call.tx.send(result);
    }

    async fn respond(&self, header: Header, meta: &MethodMetadata, outcome: Result<Arg>) {
        let marshaled = outcome.and_then(|result| {
            let payload = Payload::new(result, header.namespace.clone(), header.method.clone());
            marshal::marshal_return(self, payload, meta)
        });

        let frame = match marshaled {
            Ok(marshaled) => match settle_all(&marshaled.waits).await {
                Ok(()) => Frame::response(header, marshaled.value),
                Err(e) => Frame::error(header, e.to_fault()),
            },
            Err(e) => Frame::error(header, e.to_fault()),
        };

        self.send_frame(frame).await;
    }

    fn spawn_fault(&self, header: Header, error: Error) {
        let adaptor = self.clone();
        tokio::spawn(async move {
            adaptor.send_frame(Frame::error(header, error.to_fault())).await;
        });
    }

    /// Sends a reply, falling back to an error reply when the reply cannot be encoded.
    async fn send_frame(&self, frame: Frame) {
        let bytes = match self.encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(peer = self.peer_id(), id = %frame.header.id, error = %e, "reply not encodable");
                let fallback = Frame::error(frame.header, e.to_fault());
                match self.encode_frame(&fallback) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(peer = self.peer_id(), id = %fallback.header.id, error = %e, "dropping reply");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.0.channel.send(&bytes).await {
            tracing::warn!(peer = self.peer_id(), error = %e, "failed to send reply");
        }
    }
}

/// Waits until every proxy in `proxies` has been instantiated on the peer.
pub(crate) async fn settle_all(proxies: &[Proxy]) -> Result<()> {
    for proxy in proxies {
        proxy.ready().await?;
    }
    Ok(())
}

/// An encoded request, not yet on the channel.
pub(crate) struct Outgoing {
    adaptor: Adaptor,
    header: Header,
    meta: Arc<MethodMetadata>,
    bytes: Vec<u8>,
    /// Proxies passed as arguments that the peer must know before this request.
    waits: Vec<Proxy>,
}

impl Outgoing {
    /// Records the pending call and writes the request to the channel.
    pub(crate) async fn send(self) -> Result<Reply> {
        settle_all(&self.waits).await?;

        let inner = &self.adaptor.0;
        let id = self.header.id;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), PendingCall { meta: self.meta, tx });

        if inner.closed.load(Ordering::SeqCst) {
            inner.pending.remove(&id);
            return Err(TransportError::ConnectionLost("Channel closed".into()).into());
        }

        tracing::debug!(
            peer = self.adaptor.peer_id(),
            id = %id,
            namespace = %self.header.namespace,
            method = %self.header.method,
            "sending request"
        );

        if let Err(e) = inner.channel.send(&self.bytes).await {
            inner.pending.remove(&id);
            return Err(e.into());
        }

        Ok(Reply { rx })
    }
}

/// The eventual outcome of a sent request.
pub(crate) struct Reply {
    rx: oneshot::Receiver<Result<Arg>>,
}

impl Reply {
    pub(crate) async fn wait(self) -> Result<Arg> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionLost("Pending call dropped".into()).into()),
        }
    }
}
