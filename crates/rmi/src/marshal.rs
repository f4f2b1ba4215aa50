//! # Marshaling Policy
//!
//! Turns arguments and return values into wire values according to their
//! declared `ParameterType`, and back.
//!
//! ## Invariants
//! - **Checked Before Send**: A value that does not fit its declared type fails
//!   with a `SerializationError` before anything is written to the channel.
//! - **Resolved by the Receiver**: A `RemoteRef` is only ever looked up in the
//!   registry of the peer that receives it.
//! - **Identity**: A callback or object that comes back to the peer that owns it
//!   resolves to the original, not to a new proxy.

use rmiwire::RemoteRef;
use rmiwire::Val;

use crate::adaptor::Adaptor;
use crate::arg::Arg;
use crate::arg::Callback;
use crate::arg::CallbackKind;
use crate::arg::Object;
use crate::class::Proxy;
use crate::class::ProxyState;
use crate::error::Error;
use crate::error::ProtocolError;
use crate::error::Result;
use crate::error::SerializationError;
use crate::metadata::MethodMetadata;
use crate::metadata::ParameterType;
use crate::namespace::CALLBACK_METHOD;
use crate::namespace::Owner;
use crate::payload::Payload;

/// Wire values plus the proxies the peer must know before they are sent.
pub(crate) struct Marshaled<T> {
    pub value: T,
    pub waits: Vec<Proxy>,
}

/// Marshals call arguments. Local callbacks are registered on behalf of `scope`.
pub(crate) fn marshal_args(
    adaptor: &Adaptor,
    payload: &Payload<Vec<Arg>>,
    meta: &MethodMetadata,
    scope: &str,
) -> Result<Marshaled<Vec<Val>>> {
    let mut waits = Vec::new();
    let mut value = Vec::with_capacity(payload.data().len());
    for (position, arg) in payload.data().iter().enumerate() {
        let item = payload.new_payload(arg);
        value.push(marshal_one(adaptor, &item, scope, Some(position), meta.param_type(position), &mut waits)?);
    }
    Ok(Marshaled { value, waits })
}

/// Marshals a handler's result, registering local callbacks on behalf of the
/// handler's own namespace.
pub(crate) fn marshal_return(adaptor: &Adaptor, payload: Payload<Arg>, meta: &MethodMetadata) -> Result<Marshaled<Val>> {
    let mut waits = Vec::new();
    let item = payload.new_payload(payload.data());
    let value = marshal_one(adaptor, &item, payload.namespace(), None, meta.return_type(), &mut waits)?;
    Ok(Marshaled { value, waits })
}

fn marshal_one(
    adaptor: &Adaptor,
    item: &Payload<&Arg>,
    scope: &str,
    position: Option<usize>,
    ty: ParameterType,
    waits: &mut Vec<Proxy>,
) -> Result<Val> {
    let fail = |reason: String| -> Error {
        SerializationError {
            namespace: item.namespace().to_owned(),
            method: item.method().to_owned(),
            position,
            reason,
        }
        .into()
    };

    match (ty, *item.data()) {
        (ParameterType::Serializable, Arg::Data(val)) if val.contains_ref() => {
            Err(fail("plain data may not contain remote references".into()))
        }
        (ParameterType::Serializable, Arg::Data(val)) => Ok(val.clone()),
        (ParameterType::Serializable, other) => {
            Err(fail(format!("{} passed where serializable data was declared", other.kind())))
        }
        // Absent callback or object.
        (ParameterType::Callback | ParameterType::RemoteObject, Arg::Data(Val::Unit)) => Ok(Val::Unit),
        (ParameterType::Callback, Arg::Callback(callback)) => Ok(Val::Ref(callback_ref(adaptor, callback, scope))),
        (ParameterType::Callback, other) => Err(fail(format!("{} passed where a callback was declared", other.kind()))),
        (ParameterType::RemoteObject, Arg::Object(object)) => object_ref(object, waits).map(Val::Ref),
        (ParameterType::RemoteObject, other) => {
            Err(fail(format!("{} passed where a remote object was declared", other.kind())))
        }
    }
}

fn callback_ref(adaptor: &Adaptor, callback: &Callback, scope: &str) -> RemoteRef {
    match callback.kind() {
        // Hand the peer its own function back.
        CallbackKind::Remote { reference, .. } => reference.clone(),
        CallbackKind::Local(_) => {
            let id = adaptor.registry().register_callback(callback, scope, || adaptor.new_namespace_id());
            tracing::debug!(peer = adaptor.peer_id(), namespace = %id, scope, "registered callback");
            RemoteRef::callback(id, CALLBACK_METHOD)
        }
    }
}

fn object_ref(object: &Object, waits: &mut Vec<Proxy>) -> Result<RemoteRef> {
    match object {
        Object::Local(local) => Ok(RemoteRef::object(local.namespace())),
        Object::Remote(proxy) => match proxy.state() {
            ProxyState::Released => Err(ProtocolError::Released(proxy.namespace().to_owned()).into()),
            ProxyState::Ready => Ok(RemoteRef::object(proxy.namespace())),
            ProxyState::Constructed | ProxyState::Initializing | ProxyState::Failed => {
                waits.push(proxy.clone());
                Ok(RemoteRef::object(proxy.namespace()))
            }
        },
    }
}

/// Unmarshals request arguments received from the peer.
pub(crate) fn unmarshal_args(adaptor: &Adaptor, payload: Payload<Vec<Val>>, meta: &MethodMetadata) -> Result<Vec<Arg>> {
    payload
        .data()
        .iter()
        .enumerate()
        .map(|(position, val)| unmarshal_one(adaptor, payload.new_payload(val), meta.param_type(position)))
        .collect()
}

/// Unmarshals a result received from the peer.
pub(crate) fn unmarshal_return(adaptor: &Adaptor, payload: Payload<Val>, meta: &MethodMetadata) -> Result<Arg> {
    unmarshal_one(adaptor, payload.new_payload(payload.data()), meta.return_type())
}

fn unmarshal_one(adaptor: &Adaptor, item: Payload<&Val>, ty: ParameterType) -> Result<Arg> {
    let malformed = |what: String| -> Error {
        ProtocolError::Malformed(format!("{}.{}: {}", item.namespace(), item.method(), what)).into()
    };

    match (ty, *item.data()) {
        (ParameterType::Serializable, val) if val.contains_ref() => {
            Err(malformed("reference where serializable data was declared".into()))
        }
        (ParameterType::Serializable, val) => Ok(Arg::Data(val.clone())),
        (ParameterType::Callback | ParameterType::RemoteObject, Val::Unit) => Ok(Arg::unit()),
        (ParameterType::Callback, Val::Ref(reference)) if reference.is_callback() => {
            Ok(Arg::Callback(resolve_callback(adaptor, reference)))
        }
        (ParameterType::RemoteObject, Val::Ref(reference)) => resolve_object(adaptor, reference).map(Arg::Object),
        (ty, val) => Err(malformed(format!("expected {:?}, found {}", ty, val.kind()))),
    }
}

fn resolve_callback(adaptor: &Adaptor, reference: &RemoteRef) -> Callback {
    match adaptor.registry().owner(&reference.namespace) {
        Some(Owner::Callback(callback)) => callback,
        _ => Callback::remote(reference.clone(), adaptor.downgrade()),
    }
}

fn resolve_object(adaptor: &Adaptor, reference: &RemoteRef) -> Result<Object> {
    match adaptor.registry().owner(&reference.namespace) {
        Some(Owner::Object(local)) => Ok(Object::Local(local)),
        Some(Owner::Global | Owner::Callback(_)) => Err(ProtocolError::Malformed(format!(
            "namespace '{}' is not an object",
            reference.namespace
        ))
        .into()),
        Some(Owner::Proxy(_)) | None => {
            let proxy = adaptor.registry().proxy_or_insert(&reference.namespace, || {
                Proxy::materialized(reference.namespace.clone(), adaptor.downgrade())
            })?;
            Ok(Object::Remote(proxy))
        }
    }
}
