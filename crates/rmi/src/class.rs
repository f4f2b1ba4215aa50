//! # Class Bridges
//!
//! `RemoteClass` builds proxies for instances that live on the peer.
//! `LocalClass` lets the peer instantiate a local type under a namespace it
//! chose. Both sides are driven by explicit method tables fixed at definition
//! time.
//!
//! ## Lifecycle
//!
//! A proxy moves `Constructed -> Initializing -> Ready -> Released`, or to
//! `Failed` if the peer refuses the instance. Calls made while `Initializing`
//! wait their turn behind the instantiation, in the order they were issued.
//! Nothing leaves `Released`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

use crate::adaptor::Adaptor;
use crate::adaptor::WeakAdaptor;
use crate::arg::Arg;
use crate::arg::Handler;
use crate::arg::LocalObject;
use crate::channel::TransportError;
use crate::error::Error;
use crate::error::ProtocolError;
use crate::error::Result;
use crate::metadata::MethodMetadata;
use crate::metadata::ParameterType;
use crate::namespace::Entry;
use crate::namespace::GLOBAL;
use crate::namespace::Method;
use crate::namespace::Owner;

/// Name of the global method that instantiates local class `id`.
pub fn new_instance_method(id: &str) -> String {
    format!("{}-new-instance", id)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Constructed = 0,
    Initializing = 1,
    Ready = 2,
    Failed = 3,
    Released = 4,
}

impl ProxyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProxyState::Constructed,
            1 => ProxyState::Initializing,
            2 => ProxyState::Ready,
            3 => ProxyState::Failed,
            _ => ProxyState::Released,
        }
    }
}

/// Shared between a proxy and the task instantiating it.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ProxyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ProxyState {
        ProxyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ProxyState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves out of `Initializing` unless the proxy was released meanwhile.
    fn finish(&self, state: ProxyState) {
        let _ = self.0.compare_exchange(
            ProxyState::Initializing as u8,
            state as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<()>>>;

/// A method of a remote class that runs on the calling side.
pub type LocalMethod = Arc<dyn Fn(Proxy, Vec<Arg>) -> BoxFuture<'static, Result<Arg>> + Send + Sync>;

pub(crate) struct ProxyInner {
    namespace: String,
    class: Option<Arc<ClassSpec>>,
    adaptor: WeakAdaptor,
    state: Arc<StateCell>,
    init: InitFuture,
    /// Held from the start of a call until its request is on the channel.
    gate: Mutex<()>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        // The peer keeps its instance; only this side's bookkeeping goes.
        let Ok(adaptor) = self.adaptor.upgrade() else {
            return;
        };
        if adaptor.registry().forget_proxy(&self.namespace) {
            tracing::trace!(peer = adaptor.peer_id(), namespace = %self.namespace, "forgot dropped proxy");
        }
    }
}

/// A local stand-in for an instance owned by the peer.
#[derive(Clone)]
pub struct Proxy(Arc<ProxyInner>);

impl Proxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.0)
    }

    /// A proxy for an instance the peer already has, received as an argument or result.
    pub(crate) fn materialized(namespace: String, adaptor: WeakAdaptor) -> Self {
        Self(Arc::new(ProxyInner {
            namespace,
            class: None,
            adaptor,
            state: Arc::new(StateCell::new(ProxyState::Ready)),
            init: futures::future::ready(Ok(())).boxed().shared(),
            gate: Mutex::new(()),
        }))
    }

    pub fn namespace(&self) -> &str {
        &self.0.namespace
    }

    /// Id of the class this proxy was constructed from. `None` for proxies
    /// received from the peer.
    pub fn class(&self) -> Option<&str> {
        self.0.class.as_ref().map(|spec| spec.id.as_str())
    }

    pub fn state(&self) -> ProxyState {
        self.0.state.get()
    }

    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Waits until the peer has instantiated the object.
    pub async fn ready(&self) -> Result<()> {
        if self.state() == ProxyState::Released {
            return Err(ProtocolError::Released(self.0.namespace.clone()).into());
        }
        self.0.init.clone().await
    }

    /// Calls a method by name.
    ///
    /// Class-built proxies use the metadata declared on the class and run local
    /// methods in place; any other name is refused. Received proxies marshal every
    /// argument as plain data.
    pub async fn call(&self, method: &str, args: Vec<Arg>) -> Result<Arg> {
        let meta = match &self.0.class {
            Some(spec) => {
                if let Some(local) = spec.locals.get(method) {
                    return local(self.clone(), args).await;
                }
                spec.methods.get(method).cloned().ok_or_else(|| ProtocolError::UnknownMethod {
                    namespace: self.0.namespace.clone(),
                    method: method.to_owned(),
                })?
            }
            None => Arc::new(MethodMetadata::new(method)),
        };
        self.send(meta, args).await
    }

    /// Calls a method with explicit metadata.
    pub async fn call_with(&self, meta: impl Into<MethodMetadata>, args: Vec<Arg>) -> Result<Arg> {
        self.send(Arc::new(meta.into()), args).await
    }

    async fn send(&self, meta: Arc<MethodMetadata>, args: Vec<Arg>) -> Result<Arg> {
        let adaptor = self.0.adaptor.upgrade()?;
        let reply = {
            let _turn = self.0.gate.lock().await;
            self.ready().await?;
            adaptor.prepare(&self.0.namespace, meta, args)?.send().await?
        };
        reply.wait().await
    }

    /// Releases the instance here and on the peer.
    ///
    /// Resolves to whether the peer still had the instance.
    pub async fn release(&self) -> Result<bool> {
        let adaptor = self.0.adaptor.upgrade()?;
        let _turn = self.0.gate.lock().await;
        if self.state() == ProxyState::Released {
            return Err(ProtocolError::Released(self.0.namespace.clone()).into());
        }

        // The instantiation must reach the peer before the release does.
        let _ = self.0.init.clone().await;
        self.0.state.set(ProxyState::Released);
        adaptor.registry().remove_tree(&self.0.namespace);
        tracing::debug!(peer = adaptor.peer_id(), namespace = %self.0.namespace, "released proxy");

        adaptor.release_remote(&self.0.namespace).await
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("namespace", &self.0.namespace)
            .field("class", &self.class())
            .field("state", &self.state())
            .finish()
    }
}

/// The calling side's definition of a remote class.
pub struct ClassSpec {
    id: String,
    constructor: Vec<ParameterType>,
    methods: HashMap<String, Arc<MethodMetadata>>,
    locals: HashMap<String, LocalMethod>,
}

impl ClassSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            constructor: Vec::new(),
            methods: HashMap::new(),
            locals: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declares the constructor's parameter types.
    pub fn constructor(mut self, params: impl IntoIterator<Item = ParameterType>) -> Self {
        self.constructor = params.into_iter().collect();
        self
    }

    /// Declares a method forwarded to the peer.
    pub fn method(mut self, meta: impl Into<MethodMetadata>) -> Self {
        let meta = meta.into();
        self.methods.insert(meta.name().to_owned(), Arc::new(meta));
        self
    }

    /// Declares a method that runs on the calling side and is never forwarded.
    pub fn local<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Proxy, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arg>> + Send + 'static,
    {
        let name = name.into();
        self.methods.remove(&name);
        self.locals.insert(name, Arc::new(move |proxy: Proxy, args: Vec<Arg>| f(proxy, args).boxed()));
        self
    }
}

/// Produces proxies for one remote class.
#[derive(Clone)]
pub struct RemoteClass {
    spec: Arc<ClassSpec>,
    adaptor: WeakAdaptor,
}

impl RemoteClass {
    pub(crate) fn new(spec: ClassSpec, adaptor: WeakAdaptor) -> Self {
        Self { spec: Arc::new(spec), adaptor }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Creates a proxy and asks the peer to instantiate the class under a fresh namespace.
    ///
    /// Arguments are marshaled before this returns; the instantiation itself runs
    /// in the background. Calls on the proxy wait for it.
    pub fn new_instance(&self, args: Vec<Arg>) -> Result<Proxy> {
        let adaptor = self.adaptor.upgrade()?;
        let namespace = adaptor.new_namespace_id();

        let meta = MethodMetadata::new(new_instance_method(&self.spec.id))
            .param(ParameterType::Serializable)
            .params(self.spec.constructor.iter().copied());
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Arg::from(namespace.as_str()));
        call_args.extend(args);

        let state = Arc::new(StateCell::new(ProxyState::Constructed));
        let (done, outcome) = oneshot::channel::<Result<()>>();
        let init = async move {
            match outcome.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Transport(TransportError::ConnectionLost("Instantiation abandoned".into()))),
            }
        }
        .boxed()
        .shared();

        let proxy = Proxy(Arc::new(ProxyInner {
            namespace: namespace.clone(),
            class: Some(self.spec.clone()),
            adaptor: self.adaptor.clone(),
            state: state.clone(),
            init,
            gate: Mutex::new(()),
        }));

        // Registered first so callbacks among the arguments are scoped to it.
        adaptor.registry().insert(&namespace, Entry::new(Owner::Proxy(proxy.downgrade())))?;
        let outgoing = match adaptor.prepare_scoped(GLOBAL, &namespace, Arc::new(meta), call_args) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                adaptor.registry().remove_tree(&namespace);
                return Err(e);
            }
        };

        state.set(ProxyState::Initializing);
        tokio::spawn(async move {
            let outcome = match outgoing.send().await {
                Ok(reply) => reply.wait().await.map(|_| ()),
                Err(e) => Err(e),
            };
            state.finish(if outcome.is_ok() { ProxyState::Ready } else { ProxyState::Failed });
            let _ = done.send(outcome);
        });

        tracing::debug!(peer = adaptor.peer_id(), class = %self.spec.id, namespace = %namespace, "constructed proxy");
        Ok(proxy)
    }
}

type MethodFn<T> = Arc<dyn Fn(Arc<T>, Vec<Arg>) -> BoxFuture<'static, Result<Arg>> + Send + Sync>;

/// The methods of a local type, as exposed to the peer.
pub struct MethodTable<T> {
    methods: Vec<(Arc<MethodMetadata>, MethodFn<T>)>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self { methods: Vec::new() }
    }
}

impl<T> Clone for MethodTable<T> {
    fn clone(&self) -> Self {
        Self { methods: self.methods.clone() }
    }
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, meta: impl Into<MethodMetadata>, f: F) -> Self
    where
        F: Fn(&T, Vec<Arg>) -> Result<Arg> + Send + Sync + 'static,
    {
        let f: MethodFn<T> =
            Arc::new(move |instance: Arc<T>, args: Vec<Arg>| futures::future::ready(f(&*instance, args)).boxed());
        self.methods.push((Arc::new(meta.into()), f));
        self
    }

    pub fn method_async<F, Fut>(mut self, meta: impl Into<MethodMetadata>, f: F) -> Self
    where
        F: Fn(Arc<T>, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arg>> + Send + 'static,
    {
        let f: MethodFn<T> = Arc::new(move |instance: Arc<T>, args: Vec<Arg>| f(instance, args).boxed());
        self.methods.push((Arc::new(meta.into()), f));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Binds every method to `instance`.
    pub(crate) fn bind(&self, instance: &Arc<T>) -> Result<Vec<Method>> {
        let mut seen = std::collections::HashSet::new();
        let mut bound = Vec::with_capacity(self.methods.len());
        for (meta, f) in &self.methods {
            if !seen.insert(meta.name()) {
                return Err(ProtocolError::DuplicateMethod {
                    namespace: String::new(),
                    method: meta.name().to_owned(),
                }
                .into());
            }
            let instance = instance.clone();
            let f = f.clone();
            let handler: Handler = Arc::new(move |args: Vec<Arg>| f(instance.clone(), args));
            bound.push(Method { meta: meta.clone(), handler });
        }
        Ok(bound)
    }
}

type Factory<T> = Arc<dyn Fn(Vec<Arg>) -> Result<T> + Send + Sync>;

/// The owning side's definition of a class the peer may instantiate.
pub struct LocalClass<T> {
    id: String,
    constructor: Vec<ParameterType>,
    factory: Factory<T>,
    methods: MethodTable<T>,
}

impl<T: Send + Sync + 'static> LocalClass<T> {
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            constructor: Vec::new(),
            factory: Arc::new(factory),
            methods: MethodTable::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declares the constructor's parameter types.
    pub fn constructor(mut self, params: impl IntoIterator<Item = ParameterType>) -> Self {
        self.constructor = params.into_iter().collect();
        self
    }

    pub fn method<F>(mut self, meta: impl Into<MethodMetadata>, f: F) -> Self
    where
        F: Fn(&T, Vec<Arg>) -> Result<Arg> + Send + Sync + 'static,
    {
        self.methods = self.methods.method(meta, f);
        self
    }

    pub fn method_async<F, Fut>(mut self, meta: impl Into<MethodMetadata>, f: F) -> Self
    where
        F: Fn(Arc<T>, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arg>> + Send + 'static,
    {
        self.methods = self.methods.method_async(meta, f);
        self
    }

    /// The global `<id>-new-instance` method instantiating this class.
    pub(crate) fn into_constructor(self, adaptor: WeakAdaptor) -> Method {
        let meta = MethodMetadata::new(new_instance_method(&self.id))
            .param(ParameterType::Serializable)
            .params(self.constructor.iter().copied());

        let class = Arc::new(self);
        let handler: Handler = Arc::new(move |mut args: Vec<Arg>| {
            let outcome = adaptor.upgrade().and_then(|adaptor| {
                if args.is_empty() {
                    return Err(ProtocolError::Malformed("missing namespace id".into()).into());
                }
                let namespace = args.remove(0);
                let namespace = namespace
                    .as_str()
                    .ok_or_else(|| ProtocolError::Malformed(format!("namespace id is {}", namespace.kind())))?;
                let instance = Arc::new((class.factory)(args)?);
                register_instance(&adaptor, namespace, Some(class.id.clone()), instance, &class.methods)?;
                Ok(Arg::unit())
            });
            futures::future::ready(outcome).boxed()
        });

        Method { meta: Arc::new(meta), handler }
    }
}

/// Registers `instance` and its methods under `namespace`.
pub(crate) fn register_instance<T: Send + Sync + 'static>(
    adaptor: &Adaptor,
    namespace: &str,
    class: Option<String>,
    instance: Arc<T>,
    methods: &MethodTable<T>,
) -> Result<LocalObject> {
    let bound = methods.bind(&instance)?;
    let object = LocalObject::new(namespace, class, instance);
    adaptor
        .registry()
        .insert(namespace, Entry::new(Owner::Object(object.clone())).with_methods(bound))?;
    tracing::debug!(peer = adaptor.peer_id(), namespace, class = ?object.class(), "registered local instance");
    Ok(object)
}
