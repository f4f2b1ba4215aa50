//! Unit tests for the registry, marshaling policy and error mapping.

use std::sync::Arc;

use rmiwire::FaultCode;
use rmiwire::RemoteRef;
use rmiwire::Val;
use tokio::task::JoinHandle;

use crate::adaptor::Adaptor;
use crate::arg::Arg;
use crate::arg::Callback;
use crate::arg::LocalObject;
use crate::arg::Object;
use crate::arg::handler;
use crate::channel::LocalChannel;
use crate::config::Config;
use crate::error::Error;
use crate::error::Exception;
use crate::error::ProtocolError;
use crate::marshal;
use crate::metadata::MethodMetadata;
use crate::metadata::ParameterType;
use crate::namespace::Entry;
use crate::namespace::GLOBAL;
use crate::namespace::Method;
use crate::namespace::Owner;
use crate::namespace::Registry;
use crate::payload::Payload;

/// An adaptor whose peer never answers. The returned channel end keeps it open.
fn lonely_adaptor() -> (Adaptor, LocalChannel, JoinHandle<()>) {
    let (a, b) = LocalChannel::pair();
    let (adaptor, pump) = Adaptor::spawn(Config::new("test"), Box::new(a));
    (adaptor, b, pump)
}

fn noop_method(name: &str) -> Method {
    Method {
        meta: Arc::new(MethodMetadata::new(name)),
        handler: handler(|_| Ok(Arg::unit())),
    }
}

// ============================================================================
//  METADATA & PAYLOAD
// ============================================================================

#[test]
fn test_undeclared_positions_are_serializable() {
    let meta = MethodMetadata::new("download")
        .param(ParameterType::Serializable)
        .param(ParameterType::Callback);

    assert_eq!(meta.param_type(0), ParameterType::Serializable);
    assert_eq!(meta.param_type(1), ParameterType::Callback);
    assert_eq!(meta.param_type(7), ParameterType::Serializable);
    assert_eq!(meta.return_type(), ParameterType::Serializable);
}

#[test]
fn test_new_payload_keeps_context() {
    let payload = Payload::new(vec![1, 2, 3], "ns-1", "sum");
    let rewrapped = payload.new_payload("encoded");

    assert_eq!(*rewrapped.data(), "encoded");
    assert_eq!(rewrapped.namespace(), "ns-1");
    assert_eq!(rewrapped.method(), "sum");
    assert_eq!(payload.into_data(), vec![1, 2, 3]);
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[test]
fn test_registry_starts_with_global() {
    let registry = Registry::new();
    assert!(registry.contains(GLOBAL));
    assert_eq!(registry.len(), 1);
    assert!(matches!(registry.owner(GLOBAL), Some(Owner::Global)));
}

#[test]
fn test_registry_rejects_duplicate_namespace() {
    let registry = Registry::new();
    registry.insert("a", Entry::new(Owner::Global)).unwrap();

    let err = registry.insert("a", Entry::new(Owner::Global)).unwrap_err();
    assert_eq!(err, ProtocolError::DuplicateNamespace("a".into()));
}

#[test]
fn test_registry_rejects_duplicate_method() {
    let registry = Registry::new();
    registry.add_method(GLOBAL, noop_method("ping")).unwrap();

    let err = registry.add_method(GLOBAL, noop_method("ping")).unwrap_err();
    assert!(matches!(err, ProtocolError::DuplicateMethod { .. }));

    assert!(registry.remove_method(GLOBAL, "ping"));
    assert!(!registry.remove_method(GLOBAL, "ping"));
    registry.add_method(GLOBAL, noop_method("ping")).unwrap();
}

#[test]
fn test_registry_resolve_errors() {
    let registry = Registry::new();
    registry.add_method(GLOBAL, noop_method("ping")).unwrap();

    assert!(registry.resolve(GLOBAL, "ping").is_ok());
    assert_eq!(
        registry.resolve("nowhere", "ping").err(),
        Some(ProtocolError::UnknownNamespace("nowhere".into()))
    );
    assert!(matches!(
        registry.resolve(GLOBAL, "pong").err(),
        Some(ProtocolError::UnknownMethod { .. })
    ));
    assert!(matches!(
        registry.add_method("nowhere", noop_method("x")),
        Err(ProtocolError::UnknownNamespace(_))
    ));
}

#[test]
fn test_registry_callback_reuse() {
    let registry = Registry::new();
    let callback = Callback::new(|_| Ok(Arg::unit()));
    let counter = std::cell::Cell::new(0);
    let fresh = || {
        counter.set(counter.get() + 1);
        format!("cb-{}", counter.get())
    };

    let first = registry.register_callback(&callback, GLOBAL, &fresh);
    let second = registry.register_callback(&callback.clone(), GLOBAL, &fresh);
    assert_eq!(first, second);
    assert!(registry.has_method(&first, "callback"));

    let other = Callback::new(|_| Ok(Arg::unit()));
    let third = registry.register_callback(&other, GLOBAL, &fresh);
    assert_ne!(first, third);
}

#[test]
fn test_remove_tree_takes_children() {
    let registry = Registry::new();
    registry.insert("obj", Entry::new(Owner::Global)).unwrap();

    let callback = Callback::new(|_| Ok(Arg::unit()));
    let id = registry.register_callback(&callback, "obj", || "obj-cb".to_owned());
    assert!(registry.contains(&id));

    assert!(registry.remove_tree("obj"));
    assert!(!registry.contains("obj"));
    assert!(!registry.contains(&id));
    assert!(!registry.remove_tree("obj"));

    // The callback is forgotten, so sending it again registers it anew.
    let again = registry.register_callback(&callback, GLOBAL, || "obj-cb-2".to_owned());
    assert_eq!(again, "obj-cb-2");
}

#[test]
fn test_shared_callback_lives_until_last_scope() {
    let registry = Registry::new();
    registry.insert("a", Entry::new(Owner::Global)).unwrap();
    registry.insert("b", Entry::new(Owner::Global)).unwrap();

    let callback = Callback::new(|_| Ok(Arg::unit()));
    let id = registry.register_callback(&callback, "a", || "shared-cb".to_owned());
    assert_eq!(registry.register_callback(&callback, "b", || "unused".to_owned()), id);
    // Registering again for the same scope takes no further hold.
    assert_eq!(registry.register_callback(&callback, "b", || "unused".to_owned()), id);

    registry.remove_tree("a");
    assert!(registry.contains(&id));
    registry.remove_tree("b");
    assert!(!registry.contains(&id));
}

#[test]
fn test_remove_tree_keeps_global() {
    let registry = Registry::new();
    assert!(!registry.remove_tree(GLOBAL));
    assert!(registry.contains(GLOBAL));
}

// ============================================================================
//  ERRORS
// ============================================================================

#[test]
fn test_exception_fault_is_verbatim() {
    let error = Error::Exception(Exception::with_stack("boom", "at parse (input.rs:10)"));
    let fault = error.to_fault();
    assert_eq!(fault.code, FaultCode::Exception);

    match Error::from_fault(fault) {
        Error::RemoteExecution(e) => {
            assert_eq!(e.message(), "boom");
            assert_eq!(e.stack(), Some("at parse (input.rs:10)"));
        }
        other => panic!("expected remote execution error, got {:?}", other),
    }
}

#[test]
fn test_protocol_fault_stays_protocol() {
    let error: Error = ProtocolError::UnknownNamespace("gone".into()).into();
    let fault = error.to_fault();
    assert_eq!(fault.code, FaultCode::Protocol);
    assert!(fault.message.contains("gone"));

    assert!(matches!(Error::from_fault(fault), Error::Protocol(ProtocolError::Rejected(_))));
}

#[test]
fn test_anyhow_becomes_exception() {
    let error: Error = anyhow::anyhow!("disk full").into();
    match error {
        Error::Exception(e) => assert_eq!(e.message(), "disk full"),
        other => panic!("expected exception, got {:?}", other),
    }
}

// ============================================================================
//  MARSHALING
// ============================================================================

#[tokio::test]
async fn test_function_as_serializable_is_rejected() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("store");
    let callback = Callback::new(|_| Ok(Arg::unit()));
    let payload = Payload::new(vec![Arg::from(1i64), Arg::from(callback)], GLOBAL, "store");

    let Err(Error::Serialization(e)) = marshal::marshal_args(&adaptor, &payload, &meta, GLOBAL) else {
        panic!("expected serialization error");
    };
    assert_eq!(e.method, "store");
    assert_eq!(e.position, Some(1));
    // Nothing was registered for the rejected call.
    assert_eq!(adaptor.namespaces(), 1);
    pump.abort();
}

#[tokio::test]
async fn test_reference_inside_data_is_rejected() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("store");
    let smuggled = Val::List(vec![Val::Ref(RemoteRef::object("elsewhere"))]);
    let payload = Payload::new(vec![Arg::from(smuggled)], GLOBAL, "store");

    assert!(matches!(
        marshal::marshal_args(&adaptor, &payload, &meta, GLOBAL),
        Err(Error::Serialization(_))
    ));
    pump.abort();
}

#[tokio::test]
async fn test_callback_marshals_to_reference() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("subscribe").param(ParameterType::Callback);
    let callback = Callback::new(|_| Ok(Arg::unit()));
    let payload = Payload::new(vec![Arg::from(callback.clone())], GLOBAL, "subscribe");

    let Ok(first) = marshal::marshal_args(&adaptor, &payload, &meta, GLOBAL) else {
        panic!("marshaling failed");
    };
    let reference = first.value[0].as_remote().cloned().unwrap();
    assert!(reference.is_callback());
    assert!(adaptor.registry().contains(&reference.namespace));

    let Ok(second) = marshal::marshal_args(&adaptor, &payload, &meta, GLOBAL) else {
        panic!("marshaling failed");
    };
    assert_eq!(second.value[0].as_remote(), Some(&reference));

    // Our own reference comes back as our own callback.
    let incoming = Payload::new(vec![Val::Ref(reference)], GLOBAL, "subscribe");
    let args = marshal::unmarshal_args(&adaptor, incoming, &meta).unwrap();
    assert!(args[0].as_callback().unwrap().ptr_eq(&callback));
    pump.abort();
}

#[tokio::test]
async fn test_absent_callback_is_unit() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("subscribe").param(ParameterType::Callback);
    let payload = Payload::new(vec![Arg::unit()], GLOBAL, "subscribe");

    let Ok(marshaled) = marshal::marshal_args(&adaptor, &payload, &meta, GLOBAL) else {
        panic!("marshaling failed");
    };
    assert_eq!(marshaled.value, vec![Val::Unit]);
    pump.abort();
}

#[tokio::test]
async fn test_unknown_object_materializes_one_proxy() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("take").param(ParameterType::RemoteObject);
    let incoming = || Payload::new(vec![Val::Ref(RemoteRef::object("peer:42"))], GLOBAL, "take");

    let first = marshal::unmarshal_args(&adaptor, incoming(), &meta).unwrap();
    let second = marshal::unmarshal_args(&adaptor, incoming(), &meta).unwrap();

    let a = first[0].as_proxy().unwrap();
    let b = second[0].as_proxy().unwrap();
    assert!(a.ptr_eq(b));
    assert_eq!(a.namespace(), "peer:42");
    assert_eq!(a.class(), None);
    pump.abort();
}

#[tokio::test]
async fn test_dropped_proxy_is_forgotten() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("take").param(ParameterType::RemoteObject);
    let incoming = Payload::new(vec![Val::Ref(RemoteRef::object("peer:7"))], GLOBAL, "take");

    let args = marshal::unmarshal_args(&adaptor, incoming, &meta).unwrap();
    let kept = args[0].as_proxy().unwrap().clone();
    drop(args);
    assert!(adaptor.registry().contains("peer:7"));

    drop(kept);
    assert!(!adaptor.registry().contains("peer:7"));
    assert_eq!(adaptor.namespaces(), 1);
    pump.abort();
}

#[tokio::test]
async fn test_owned_object_resolves_locally() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let object = LocalObject::new("mine", None, Arc::new(String::from("state")));
    adaptor
        .registry()
        .insert("mine", Entry::new(Owner::Object(object.clone())))
        .unwrap();

    let meta = MethodMetadata::new("take").param(ParameterType::RemoteObject);
    let incoming = Payload::new(vec![Val::Ref(RemoteRef::object("mine"))], GLOBAL, "take");
    let args = marshal::unmarshal_args(&adaptor, incoming, &meta).unwrap();

    match &args[0] {
        Arg::Object(Object::Local(local)) => {
            assert!(local.ptr_eq(&object));
            assert!(local.is::<String>());
            assert_eq!(local.downcast::<String>().as_deref().map(String::as_str), Some("state"));
        }
        other => panic!("expected local object, got {:?}", other),
    }
    pump.abort();
}

#[tokio::test]
async fn test_reference_where_data_declared_is_malformed() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let meta = MethodMetadata::new("sum");
    let incoming = Payload::new(vec![Val::Ref(RemoteRef::object("x"))], GLOBAL, "sum");

    assert!(matches!(
        marshal::unmarshal_args(&adaptor, incoming, &meta),
        Err(Error::Protocol(ProtocolError::Malformed(_)))
    ));
    pump.abort();
}

#[tokio::test]
async fn test_callback_namespace_is_not_an_object() {
    let (adaptor, _peer, pump) = lonely_adaptor();
    let callback = Callback::new(|_| Ok(Arg::unit()));
    let id = adaptor.registry().register_callback(&callback, GLOBAL, || "cb".to_owned());

    let meta = MethodMetadata::new("take").param(ParameterType::RemoteObject);
    let incoming = Payload::new(vec![Val::Ref(RemoteRef::object(id))], GLOBAL, "take");
    assert!(matches!(
        marshal::unmarshal_args(&adaptor, incoming, &meta),
        Err(Error::Protocol(ProtocolError::Malformed(_)))
    ));
    pump.abort();
}
