//! # Arguments
//!
//! What flows in and out of methods: plain data, callbacks and objects.
//!
//! Callbacks and objects keep their identity across the channel. A callback
//! this peer sent and later receives back is the same `Callback`; an object id
//! this peer owns resolves to the same `LocalObject`; a remote object id
//! resolves to the same `Proxy` for as long as that proxy is alive.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rmiwire::RemoteRef;
use rmiwire::Val;

use crate::adaptor::WeakAdaptor;
use crate::class::Proxy;
use crate::error::Result;
use crate::metadata::MethodMetadata;

/// A locally callable method body.
pub type Handler = Arc<dyn Fn(Vec<Arg>) -> BoxFuture<'static, Result<Arg>> + Send + Sync>;

/// Wraps a synchronous function as a `Handler`.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Vec<Arg>) -> Result<Arg> + Send + Sync + 'static,
{
    Arc::new(move |args| futures::future::ready(f(args)).boxed())
}

/// Wraps an async function as a `Handler`.
pub fn async_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arg>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

#[derive(Clone, Debug)]
pub enum Arg {
    Data(Val),
    Callback(Callback),
    Object(Object),
}

impl Arg {
    pub fn unit() -> Self {
        Arg::Data(Val::Unit)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Arg::Data(val) => val.kind(),
            Arg::Callback(_) => "callback",
            Arg::Object(_) => "object",
        }
    }

    pub fn as_data(&self) -> Option<&Val> {
        match self {
            Arg::Data(val) => Some(val),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Val> {
        match self {
            Arg::Data(val) => Some(val),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data().and_then(Val::as_str)
    }

    pub fn as_int(&self) -> Option<i64> {
        self.as_data().and_then(Val::as_int)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_data().and_then(Val::as_bool)
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Arg::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Arg::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Arg::Object(Object::Remote(proxy)) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalObject> {
        match self {
            Arg::Object(Object::Local(obj)) => Some(obj),
            _ => None,
        }
    }
}

impl From<Val> for Arg {
    fn from(v: Val) -> Self {
        Arg::Data(v)
    }
}

impl From<()> for Arg {
    fn from(_: ()) -> Self {
        Arg::unit()
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Data(v.into())
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Data(v.into())
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Data(v.into())
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Data(v.into())
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Data(v.into())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Data(v.into())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Data(Val::Bytes(v))
    }
}

impl From<Callback> for Arg {
    fn from(v: Callback) -> Self {
        Arg::Callback(v)
    }
}

impl From<Object> for Arg {
    fn from(v: Object) -> Self {
        Arg::Object(v)
    }
}

impl From<Proxy> for Arg {
    fn from(v: Proxy) -> Self {
        Arg::Object(Object::Remote(v))
    }
}

impl From<LocalObject> for Arg {
    fn from(v: LocalObject) -> Self {
        Arg::Object(Object::Local(v))
    }
}

/// A function that may cross the channel.
///
/// Local callbacks run in this process. Remote callbacks were received from the
/// peer and invoke the peer's function when called.
#[derive(Clone)]
pub struct Callback(Arc<CallbackKind>);

pub(crate) enum CallbackKind {
    Local(Handler),
    Remote { reference: RemoteRef, adaptor: WeakAdaptor },
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Result<Arg> + Send + Sync + 'static,
    {
        Self::from_handler(handler(f))
    }

    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arg>> + Send + 'static,
    {
        Self::from_handler(async_handler(f))
    }

    pub fn from_handler(handler: Handler) -> Self {
        Self(Arc::new(CallbackKind::Local(handler)))
    }

    pub(crate) fn remote(reference: RemoteRef, adaptor: WeakAdaptor) -> Self {
        Self(Arc::new(CallbackKind::Remote { reference, adaptor }))
    }

    pub(crate) fn kind(&self) -> &CallbackKind {
        &self.0
    }

    /// Address-based identity, stable while any clone is alive.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn is_remote(&self) -> bool {
        matches!(*self.0, CallbackKind::Remote { .. })
    }

    /// The peer's reference, for callbacks received from the peer.
    pub fn reference(&self) -> Option<&RemoteRef> {
        match &*self.0 {
            CallbackKind::Remote { reference, .. } => Some(reference),
            CallbackKind::Local(_) => None,
        }
    }

    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Invokes the callback with every argument marshaled as plain data.
    pub async fn call(&self, args: Vec<Arg>) -> Result<Arg> {
        self.invoke(None, args).await
    }

    /// Invokes the callback using the parameter and return types of `meta`.
    ///
    /// The method name of `meta` is ignored; a remote callback is always invoked
    /// under the name it was registered with.
    pub async fn call_with(&self, meta: &MethodMetadata, args: Vec<Arg>) -> Result<Arg> {
        self.invoke(Some(meta), args).await
    }

    async fn invoke(&self, meta: Option<&MethodMetadata>, args: Vec<Arg>) -> Result<Arg> {
        match &*self.0 {
            CallbackKind::Local(handler) => handler(args).await,
            CallbackKind::Remote { reference, adaptor } => {
                let adaptor = adaptor.upgrade()?;
                let method = reference.method.as_deref().unwrap_or_default();
                let meta = match meta {
                    Some(meta) => MethodMetadata::new(method)
                        .params(meta.declared_params().iter().copied())
                        .returns(meta.return_type()),
                    None => MethodMetadata::new(method),
                };
                adaptor.call(&reference.namespace, Arc::new(meta), args).await
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            CallbackKind::Local(_) => write!(f, "Callback(local@{:#x})", self.key()),
            CallbackKind::Remote { reference, .. } => write!(f, "Callback(remote {})", reference),
        }
    }
}

/// An instance addressable by namespace id: owned here, or a proxy for one
/// owned by the peer.
#[derive(Clone, Debug)]
pub enum Object {
    Local(LocalObject),
    Remote(Proxy),
}

impl Object {
    pub fn namespace(&self) -> &str {
        match self {
            Object::Local(obj) => obj.namespace(),
            Object::Remote(proxy) => proxy.namespace(),
        }
    }
}

/// A locally owned instance registered under a namespace.
#[derive(Clone)]
pub struct LocalObject(Arc<LocalObjectInner>);

struct LocalObjectInner {
    namespace: String,
    class: Option<String>,
    instance: Arc<dyn Any + Send + Sync>,
}

impl LocalObject {
    pub(crate) fn new(
        namespace: impl Into<String>,
        class: Option<String>,
        instance: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self(Arc::new(LocalObjectInner { namespace: namespace.into(), class, instance }))
    }

    pub fn namespace(&self) -> &str {
        &self.0.namespace
    }

    /// Id of the local class that constructed the instance, if any.
    pub fn class(&self) -> Option<&str> {
        self.0.class.as_deref()
    }

    /// Whether the instance is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.instance.is::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.instance.clone().downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &LocalObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject")
            .field("namespace", &self.0.namespace)
            .field("class", &self.0.class)
            .finish()
    }
}
