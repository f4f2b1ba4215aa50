//! # rmi
//!
//! Remote method invocation between two peers over one ordered, reliable
//! message channel.
//!
//! Each peer owns a registry of namespaces: the `global` one, one per object
//! instance, and one per callback it has handed out. Requests address a
//! namespace and method by name; arguments are marshaled per parameter as plain
//! data, callbacks or object references, so both functions and objects keep
//! their identity when they cross the channel.
//!
//! ```ignore
//! let (a, b) = LocalChannel::pair();
//! let server = Rmi::new("server", a);
//! let client = Rmi::new("client", b);
//!
//! server.lmethod("greet", handler(|args| {
//!     Ok(format!("hello {}", args[0].as_str().unwrap_or("?")).into())
//! }))?;
//! let reply = client.invoke("greet", vec!["world".into()]).await?;
//! ```

pub mod adaptor;
pub mod arg;
pub mod builder;
pub mod channel;
pub mod class;
pub mod config;
pub mod error;
pub mod metadata;
pub mod namespace;
pub mod payload;

mod marshal;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use rmiwire::RemoteRef;
pub use rmiwire::Val;

pub use crate::adaptor::Adaptor;
pub use crate::arg::Arg;
pub use crate::arg::Callback;
pub use crate::arg::Handler;
pub use crate::arg::LocalObject;
pub use crate::arg::Object;
pub use crate::arg::async_handler;
pub use crate::arg::handler;
pub use crate::builder::RmiBuilder;
pub use crate::channel::Channel;
pub use crate::channel::LocalChannel;
pub use crate::channel::TransportError;
pub use crate::class::ClassSpec;
pub use crate::class::LocalClass;
pub use crate::class::MethodTable;
pub use crate::class::Proxy;
pub use crate::class::ProxyState;
pub use crate::class::RemoteClass;
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::Exception;
pub use crate::error::ProtocolError;
pub use crate::error::Result;
pub use crate::error::SerializationError;
pub use crate::metadata::MethodMetadata;
pub use crate::metadata::ParameterType;
pub use crate::namespace::GLOBAL;
pub use crate::namespace::Namespace;
pub use crate::namespace::RELEASE;
pub use crate::namespace::RemoteMethod;
pub use crate::payload::Payload;

use crate::adaptor::WeakAdaptor;
use crate::namespace::Method;

/// One peer: an adaptor reading its channel, plus the global namespace.
///
/// Dropping the peer stops its pump and fails every pending call.
pub struct Rmi {
    adaptor: Adaptor,
    global: Namespace,
    pump: JoinHandle<()>,
}

impl Rmi {
    /// Starts a peer with default settings. Must be called within a tokio runtime.
    pub fn new(peer_id: impl Into<String>, channel: impl Channel) -> Self {
        Self::builder(peer_id).build(channel)
    }

    pub fn builder(peer_id: impl Into<String>) -> RmiBuilder {
        RmiBuilder::new(peer_id)
    }

    pub(crate) fn start(config: Config, channel: Box<dyn Channel>) -> Self {
        let (adaptor, pump) = Adaptor::spawn(config, channel);
        let global = Namespace::new(GLOBAL, adaptor.downgrade());

        let release = release_method(adaptor.downgrade());
        if let Err(e) = adaptor.registry().add_method(GLOBAL, release) {
            tracing::error!(peer = adaptor.peer_id(), error = %e, "could not register the release handler");
        }

        tracing::info!(peer = adaptor.peer_id(), "peer started");
        Self { adaptor, global, pump }
    }

    pub fn id(&self) -> &str {
        self.adaptor.peer_id()
    }

    pub fn adaptor(&self) -> &Adaptor {
        &self.adaptor
    }

    pub fn global(&self) -> &Namespace {
        &self.global
    }

    /// A handle on namespace `id`. The namespace need not exist yet on either side.
    pub fn namespace(&self, id: impl Into<String>) -> Namespace {
        Namespace::new(id, self.adaptor.downgrade())
    }

    /// Registers a global method the peer may call.
    pub fn lmethod(&self, meta: impl Into<MethodMetadata>, handler: Handler) -> Result<()> {
        self.global.lmethod(meta, handler)
    }

    /// Removes a global method. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        if name == RELEASE {
            return false;
        }
        self.global.unregister(name)
    }

    /// A reusable stub for a global method of the peer.
    pub fn rmethod(&self, meta: impl Into<MethodMetadata>) -> RemoteMethod {
        self.global.rmethod(meta)
    }

    /// Calls a global method of the peer with every argument as plain data.
    pub async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Arg> {
        self.global.invoke(method, args).await
    }

    /// Lets the peer instantiate `class`.
    ///
    /// Fails with `ProtocolError::DuplicateClass` if a class with the same id is
    /// already registered.
    pub fn lclass<T: Send + Sync + 'static>(&self, class: LocalClass<T>) -> Result<()> {
        let id = class.id().to_owned();
        let constructor = class.into_constructor(self.adaptor.downgrade());
        match self.adaptor.registry().add_method(GLOBAL, constructor) {
            Ok(()) => {
                tracing::debug!(peer = self.id(), class = %id, "registered local class");
                Ok(())
            }
            Err(ProtocolError::DuplicateMethod { .. }) => Err(ProtocolError::DuplicateClass(id).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// A factory for proxies of class `spec` as registered on the peer.
    pub fn rclass(&self, spec: ClassSpec) -> RemoteClass {
        RemoteClass::new(spec, self.adaptor.downgrade())
    }

    /// Registers an existing instance under a fresh namespace so it can be passed
    /// to the peer as a remote object.
    pub fn linstance<T: Send + Sync + 'static>(&self, instance: T, methods: MethodTable<T>) -> Result<LocalObject> {
        let namespace = self.adaptor.new_namespace_id();
        crate::class::register_instance(&self.adaptor, &namespace, None, Arc::new(instance), &methods)
    }

    /// Releases a remote instance here and on the peer.
    ///
    /// Fails with `ProtocolError::Unmanaged` for anything but a proxy.
    pub async fn release(&self, target: impl Into<Arg>) -> Result<bool> {
        match target.into() {
            Arg::Object(Object::Remote(proxy)) => proxy.release().await,
            _ => Err(ProtocolError::Unmanaged.into()),
        }
    }

    /// Stops reading the channel and fails every pending call.
    pub fn shutdown(&self) {
        if self.adaptor.is_closed() {
            return;
        }
        self.pump.abort();
        self.adaptor.fail_pending(TransportError::ConnectionLost("Peer shut down".into()));
        tracing::info!(peer = self.id(), "peer shut down");
    }
}

impl Drop for Rmi {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The reserved `global.release(namespace)` handler.
fn release_method(adaptor: WeakAdaptor) -> Method {
    let handler = handler(move |args: Vec<Arg>| {
        let adaptor = adaptor.upgrade()?;
        let namespace = args
            .first()
            .and_then(Arg::as_str)
            .ok_or_else(|| ProtocolError::Malformed("release expects a namespace id".into()))?;
        if namespace == GLOBAL {
            return Err(ProtocolError::Rejected("the global namespace cannot be released".into()).into());
        }
        let released = adaptor.registry().remove_tree(namespace);
        tracing::debug!(peer = adaptor.peer_id(), namespace, released, "peer released namespace");
        Ok(Arg::from(released))
    });
    Method { meta: Arc::new(MethodMetadata::new(RELEASE)), handler }
}
