//! # Namespace Registry
//!
//! Independent method sets multiplexed over one channel.
//!
//! ## Invariants
//! - **Unique Ids**: A namespace id is registered at most once at any instant.
//! - **Explicit Lifetimes**: Entries live until released. Releasing an entry also
//!   releases the callback namespaces registered on its behalf, once no other
//!   live entry holds them.
//! - **Reserved Global**: `"global"` exists from construction and carries the
//!   reserved `release` method.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;

use crate::adaptor::WeakAdaptor;
use crate::arg::Arg;
use crate::arg::Callback;
use crate::arg::CallbackKind;
use crate::arg::Handler;
use crate::arg::LocalObject;
use crate::class::Proxy;
use crate::class::ProxyInner;
use crate::error::ProtocolError;
use crate::error::Result;
use crate::metadata::MethodMetadata;

/// Id of the namespace every peer creates at construction.
pub const GLOBAL: &str = "global";

/// Reserved global method that frees a namespace on the receiving peer.
pub const RELEASE: &str = "release";

/// Method name under which a callback is registered in its own namespace.
pub(crate) const CALLBACK_METHOD: &str = "callback";

#[derive(Clone)]
pub(crate) struct Method {
    pub meta: Arc<MethodMetadata>,
    pub handler: Handler,
}

/// What a namespace id stands for on this peer.
#[derive(Clone)]
pub(crate) enum Owner {
    Global,
    /// An instance owned by this peer.
    Object(LocalObject),
    /// A function this peer sent to the other side.
    Callback(Callback),
    /// The mirror of an instance owned by the other side.
    Proxy(Weak<ProxyInner>),
}

pub(crate) struct Entry {
    owner: Owner,
    methods: HashMap<String, Method>,
    /// Namespaces released together with this one.
    children: Vec<String>,
    /// Number of entries listing this one among their children.
    holders: usize,
}

impl Entry {
    pub fn new(owner: Owner) -> Self {
        Self { owner, methods: HashMap::new(), children: Vec::new(), holders: 0 }
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        for method in methods {
            self.methods.insert(method.meta.name().to_owned(), method);
        }
        self
    }
}

/// Namespace ids to entries, plus the reverse index of sent callbacks.
pub(crate) struct Registry {
    entries: DashMap<String, Entry>,
    callbacks: DashMap<usize, String>,
}

impl Registry {
    pub fn new() -> Self {
        let entries = DashMap::new();
        entries.insert(GLOBAL.to_owned(), Entry::new(Owner::Global));
        Self { entries, callbacks: DashMap::new() }
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.entries.contains_key(namespace)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&self, namespace: &str, entry: Entry) -> std::result::Result<(), ProtocolError> {
        match self.entries.entry(namespace.to_owned()) {
            MapEntry::Occupied(_) => Err(ProtocolError::DuplicateNamespace(namespace.to_owned())),
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn add_method(&self, namespace: &str, method: Method) -> std::result::Result<(), ProtocolError> {
        let mut entry = self
            .entries
            .get_mut(namespace)
            .ok_or_else(|| ProtocolError::UnknownNamespace(namespace.to_owned()))?;
        let name = method.meta.name().to_owned();
        if entry.methods.contains_key(&name) {
            return Err(ProtocolError::DuplicateMethod { namespace: namespace.to_owned(), method: name });
        }
        entry.methods.insert(name, method);
        Ok(())
    }

    pub fn remove_method(&self, namespace: &str, method: &str) -> bool {
        // Dropped outside the shard lock, since a handler may own the last clone of a proxy.
        let removed = self.entries.get_mut(namespace).and_then(|mut entry| entry.methods.remove(method));
        removed.is_some()
    }

    pub fn has_method(&self, namespace: &str, method: &str) -> bool {
        self.entries.get(namespace).is_some_and(|entry| entry.methods.contains_key(method))
    }

    /// Finds the handler for an incoming request.
    pub fn resolve(&self, namespace: &str, method: &str) -> std::result::Result<Method, ProtocolError> {
        let entry = self
            .entries
            .get(namespace)
            .ok_or_else(|| ProtocolError::UnknownNamespace(namespace.to_owned()))?;
        entry.methods.get(method).cloned().ok_or_else(|| ProtocolError::UnknownMethod {
            namespace: namespace.to_owned(),
            method: method.to_owned(),
        })
    }

    pub fn owner(&self, namespace: &str) -> Option<Owner> {
        self.entries.get(namespace).map(|entry| entry.owner.clone())
    }

    /// Registers a local callback on behalf of `scope`, reusing the namespace of
    /// an earlier registration of the same callback.
    ///
    /// Every scope the callback is registered for holds it; it is released with
    /// the last of them.
    pub fn register_callback(&self, callback: &Callback, scope: &str, fresh_id: impl Fn() -> String) -> String {
        let existing = self.callbacks.get(&callback.key()).map(|id| id.clone());
        if let Some(id) = existing {
            self.hold(scope, &id);
            return id;
        }

        let handler: Handler = match callback.kind() {
            CallbackKind::Local(handler) => handler.clone(),
            CallbackKind::Remote { .. } => {
                let callback = callback.clone();
                Arc::new(move |args: Vec<Arg>| {
                    let callback = callback.clone();
                    async move { callback.call(args).await }.boxed()
                })
            }
        };
        let method = Method { meta: Arc::new(MethodMetadata::new(CALLBACK_METHOD)), handler };

        let id = loop {
            let id = fresh_id();
            let entry = Entry::new(Owner::Callback(callback.clone())).with_methods([method.clone()]);
            if self.insert(&id, entry).is_ok() {
                break id;
            }
        };
        self.callbacks.insert(callback.key(), id.clone());
        self.hold(scope, &id);
        id
    }

    /// Lists `child` among the children of `scope`, once.
    fn hold(&self, scope: &str, child: &str) {
        let added = match self.entries.get_mut(scope) {
            Some(mut parent) if !parent.children.iter().any(|c| c == child) => {
                parent.children.push(child.to_owned());
                true
            }
            _ => false,
        };
        if !added {
            return;
        }
        if let Some(mut entry) = self.entries.get_mut(child) {
            entry.holders += 1;
        }
    }

    /// Drops one holder of `child`, removing it when none is left.
    fn let_go(&self, child: &str) {
        let last = match self.entries.get_mut(child) {
            Some(mut entry) => {
                entry.holders = entry.holders.saturating_sub(1);
                entry.holders == 0
            }
            None => false,
        };
        if last {
            self.remove_tree(child);
        }
    }

    /// Returns the live proxy registered under `namespace`, or registers the one
    /// built by `make`. A registration whose proxy was dropped is replaced.
    pub fn proxy_or_insert(
        &self,
        namespace: &str,
        make: impl FnOnce() -> Proxy,
    ) -> std::result::Result<Proxy, ProtocolError> {
        match self.entries.entry(namespace.to_owned()) {
            MapEntry::Occupied(mut slot) => {
                let live = match &slot.get().owner {
                    Owner::Proxy(weak) => Some(weak.upgrade()),
                    _ => None,
                };
                match live {
                    Some(Some(inner)) => Ok(Proxy::from_inner(inner)),
                    Some(None) => {
                        let proxy = make();
                        slot.get_mut().owner = Owner::Proxy(proxy.downgrade());
                        Ok(proxy)
                    }
                    None => Err(ProtocolError::Malformed(format!(
                        "namespace '{}' is not a remote object",
                        namespace
                    ))),
                }
            }
            MapEntry::Vacant(slot) => {
                let proxy = make();
                slot.insert(Entry::new(Owner::Proxy(proxy.downgrade())));
                Ok(proxy)
            }
        }
    }

    /// Removes a namespace and everything registered on its behalf.
    ///
    /// Returns whether `namespace` was registered. The global namespace is never removed.
    pub fn remove_tree(&self, namespace: &str) -> bool {
        if namespace == GLOBAL {
            return false;
        }
        let Some((_, entry)) = self.entries.remove(namespace) else {
            return false;
        };
        if let Owner::Callback(callback) = &entry.owner {
            self.callbacks.remove(&callback.key());
        }
        for child in &entry.children {
            self.let_go(child);
        }
        true
    }

    /// Removes the entry of a dropped proxy, unless a live proxy took its place.
    pub fn forget_proxy(&self, namespace: &str) -> bool {
        let removed = self.entries.remove_if(namespace, |_, entry| {
            matches!(&entry.owner, Owner::Proxy(weak) if weak.strong_count() == 0)
        });
        let Some((_, entry)) = removed else {
            return false;
        };
        for child in &entry.children {
            self.let_go(child);
        }
        true
    }
}

/// A handle on one namespace id of this peer's adaptor.
///
/// Local methods are registered into this peer's entry for the id; remote
/// methods are invoked on the peer's entry with the same id.
#[derive(Clone)]
pub struct Namespace {
    id: String,
    adaptor: WeakAdaptor,
}

impl Namespace {
    pub(crate) fn new(id: impl Into<String>, adaptor: WeakAdaptor) -> Self {
        Self { id: id.into(), adaptor }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers a local method, rejecting a name already in use.
    pub fn lmethod(&self, meta: impl Into<MethodMetadata>, handler: Handler) -> Result<()> {
        let adaptor = self.adaptor.upgrade()?;
        let method = Method { meta: Arc::new(meta.into()), handler };
        tracing::debug!(peer = adaptor.peer_id(), namespace = %self.id, method = method.meta.name(), "registered local method");
        adaptor.registry().add_method(&self.id, method)?;
        Ok(())
    }

    /// Removes a local method. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.adaptor.upgrade().is_ok_and(|adaptor| adaptor.registry().remove_method(&self.id, name))
    }

    /// A reusable stub for a method of the peer's namespace with this id.
    pub fn rmethod(&self, meta: impl Into<MethodMetadata>) -> RemoteMethod {
        RemoteMethod {
            namespace: self.id.clone(),
            meta: Arc::new(meta.into()),
            adaptor: self.adaptor.clone(),
        }
    }

    /// Invokes a method of the peer's namespace, all arguments as plain data.
    pub async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Arg> {
        self.rmethod(method).call(args).await
    }

    /// Releases the remote instance behind this namespace.
    ///
    /// Fails with `ProtocolError::Unmanaged` unless this peer registered the id
    /// as a remote instance.
    pub async fn release(&self) -> Result<bool> {
        let adaptor = self.adaptor.upgrade()?;
        match adaptor.registry().owner(&self.id) {
            Some(Owner::Proxy(weak)) => match weak.upgrade() {
                Some(inner) => Proxy::from_inner(inner).release().await,
                None => {
                    adaptor.registry().remove_tree(&self.id);
                    adaptor.release_remote(&self.id).await
                }
            },
            _ => Err(ProtocolError::Unmanaged.into()),
        }
    }
}

/// A stub invoking one method of one namespace on the peer.
#[derive(Clone)]
pub struct RemoteMethod {
    namespace: String,
    meta: Arc<MethodMetadata>,
    adaptor: WeakAdaptor,
}

impl RemoteMethod {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn metadata(&self) -> &MethodMetadata {
        &self.meta
    }

    pub async fn call(&self, args: Vec<Arg>) -> Result<Arg> {
        let adaptor = self.adaptor.upgrade()?;
        adaptor.call(&self.namespace, self.meta.clone(), args).await
    }
}
