//! Callbacks crossing the channel: multiplicity, late invocation, return values
//! and identity.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rmi::Arg;
use rmi::Callback;
use rmi::Error;
use rmi::LocalChannel;
use rmi::MethodMetadata;
use rmi::ParameterType;
use rmi::Rmi;
use rmi::Val;
use rmi::async_handler;
use rmi::handler;
use rmiwire::Body;

use common::peers;

fn download_and_parse() -> MethodMetadata {
    MethodMetadata::new("downloadAndParse")
        .param(ParameterType::Serializable)
        .param(ParameterType::Serializable)
        .param(ParameterType::Callback)
}

/// Serves `downloadAndParse(url, times, receive)`, calling `receive` once per chunk.
fn serve_download(server: &Rmi) -> anyhow::Result<()> {
    server.lmethod(
        download_and_parse(),
        async_handler(|args| async move {
            let url = args[0].as_str().unwrap_or_default().to_owned();
            let times = args[1].as_int().unwrap_or_default();
            let receive = args[2].as_callback().cloned().ok_or_else(|| Error::raise("no receiver"))?;
            for chunk in 0..times {
                receive.call(vec![format!("{}#{}", url, chunk).into()]).await?;
            }
            Ok(Arg::from(times))
        }),
    )?;
    Ok(())
}

#[tokio::test]
async fn test_callback_fires_exactly_k_times() -> anyhow::Result<()> {
    let (server, client) = peers();
    serve_download(&server)?;

    for k in [0i64, 1, 5] {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let receive = {
            let seen = seen.clone();
            Callback::new(move |args| {
                seen.lock().unwrap().push(args[0].as_str().unwrap().to_owned());
                Ok(Arg::unit())
            })
        };

        let reply = client
            .rmethod(download_and_parse())
            .call(vec!["https://example.org/data".into(), k.into(), receive.into()])
            .await?;
        assert_eq!(reply.as_int(), Some(k));

        let seen = seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..k).map(|i| format!("https://example.org/data#{}", i)).collect();
        assert_eq!(seen, expected);
    }
    Ok(())
}

#[tokio::test]
async fn test_callback_fires_after_call_settled() -> anyhow::Result<()> {
    let (server, client) = peers();
    let stored: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));

    let slot = stored.clone();
    server.lmethod(
        MethodMetadata::new("subscribe").param(ParameterType::Callback),
        handler(move |args| {
            *slot.lock().unwrap() = args[0].as_callback().cloned();
            Ok(Arg::unit())
        }),
    )?;

    let slot = stored.clone();
    server.lmethod(
        "publish",
        async_handler(move |args| {
            let listener = slot.lock().unwrap().clone();
            async move {
                let listener = listener.ok_or_else(|| Error::raise("nobody subscribed"))?;
                let count = args[0].as_int().unwrap_or_default();
                for n in 0..count {
                    listener.call(vec![n.into()]).await?;
                }
                Ok(Arg::unit())
            }
        }),
    )?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = Callback::new(move |args| {
        let _ = tx.send(args[0].as_int().unwrap_or(-1));
        Ok(Arg::unit())
    });

    client
        .rmethod(MethodMetadata::new("subscribe").param(ParameterType::Callback))
        .call(vec![listener.into()])
        .await?;

    client.invoke("publish", vec![3i64.into()]).await?;
    client.invoke("publish", vec![2i64.into()]).await?;

    let mut received = Vec::new();
    while let Ok(n) = rx.try_recv() {
        received.push(n);
    }
    assert_eq!(received, vec![0, 1, 2, 0, 1]);
    Ok(())
}

#[tokio::test]
async fn test_callback_return_value_reaches_the_peer() -> anyhow::Result<()> {
    let (server, client) = peers();
    server.lmethod(
        MethodMetadata::new("combine").param(ParameterType::Callback),
        async_handler(|args| async move {
            let op = args[0].as_callback().cloned().ok_or_else(|| Error::raise("no operator"))?;
            let result = op.call(vec![2i64.into(), 3i64.into()]).await?;
            Ok(Arg::from(result.as_int().unwrap_or_default() * 10))
        }),
    )?;

    let add = Callback::new(|args| {
        let sum: i64 = args.iter().filter_map(Arg::as_int).sum();
        Ok(sum.into())
    });
    let reply = client
        .rmethod(MethodMetadata::new("combine").param(ParameterType::Callback))
        .call(vec![add.into()])
        .await?;
    assert_eq!(reply.as_int(), Some(50));
    Ok(())
}

#[tokio::test]
async fn test_callback_error_propagates_back() -> anyhow::Result<()> {
    let (server, client) = peers();
    server.lmethod(
        MethodMetadata::new("apply").param(ParameterType::Callback),
        async_handler(|args| async move {
            let f = args[0].as_callback().cloned().ok_or_else(|| Error::raise("no function"))?;
            f.call(vec![]).await
        }),
    )?;

    let failing = Callback::new(|_| Err(Error::raise("refused by client")));
    match client
        .rmethod(MethodMetadata::new("apply").param(ParameterType::Callback))
        .call(vec![failing.into()])
        .await
    {
        Err(Error::RemoteExecution(e)) => assert_eq!(e.message(), "refused by client"),
        other => panic!("expected remote execution error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_returned_callback_is_the_original() -> anyhow::Result<()> {
    let (server, client) = peers();
    let reflect = MethodMetadata::new("reflect")
        .param(ParameterType::Callback)
        .returns(ParameterType::Callback);
    server.lmethod(
        reflect.clone(),
        handler(|args| {
            let f = args[0].as_callback().cloned().ok_or_else(|| Error::raise("no function"))?;
            assert!(f.is_remote());
            Ok(f.into())
        }),
    )?;

    let original = Callback::new(|_| Ok(Arg::unit()));
    let reply = client.rmethod(reflect.clone()).call(vec![original.clone().into()]).await?;
    let back = reply.as_callback().expect("callback");
    assert!(back.ptr_eq(&original));

    // Sending it again reuses the same registration.
    let before = client.adaptor().namespaces();
    client.rmethod(reflect).call(vec![original.into()]).await?;
    assert_eq!(client.adaptor().namespaces(), before);
    Ok(())
}

#[tokio::test]
async fn test_absent_callback_is_allowed() -> anyhow::Result<()> {
    let (server, client) = peers();
    server.lmethod(
        MethodMetadata::new("maybe").param(ParameterType::Callback),
        handler(|args| Ok(args[0].as_callback().is_some().into())),
    )?;

    let reply = client
        .rmethod(MethodMetadata::new("maybe").param(ParameterType::Callback))
        .call(vec![Arg::unit()])
        .await?;
    assert_eq!(reply.as_bool(), Some(false));
    Ok(())
}

#[tokio::test]
async fn test_callback_travels_as_reference() -> anyhow::Result<()> {
    common::init_tracing();
    let (a, b) = LocalChannel::pair();
    let (tap, sent) = common::Tap::new(b);
    let server = Rmi::new("server", a);
    let client = Rmi::new("client", tap);

    let calls = Arc::new(AtomicUsize::new(0));
    server.lmethod(download_and_parse(), handler(|_| Ok(Arg::unit())))?;

    let counter = calls.clone();
    let receive = Callback::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arg::unit())
    });
    client
        .rmethod(download_and_parse())
        .call(vec!["u".into(), 0i64.into(), receive.into()])
        .await?;

    let frames = common::tapped_frames(&sent);
    let Body::Request { args } = &frames[0].body else {
        panic!("expected a request");
    };
    assert_eq!(args[0], Val::Str("u".into()));
    let reference = args[2].as_remote().expect("remote reference");
    assert_eq!(reference.method.as_deref(), Some("callback"));
    assert!(reference.namespace.starts_with("client:"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_function_declared_as_data_never_leaves() -> anyhow::Result<()> {
    common::init_tracing();
    let (a, b) = LocalChannel::pair();
    let (tap, sent) = common::Tap::new(b);
    let _server = Rmi::new("server", a);
    let client = Rmi::new("client", tap);

    let f = Callback::new(|_| Ok(Arg::unit()));
    let outcome = client.invoke("store", vec![f.into()]).await;
    assert!(matches!(outcome, Err(Error::Serialization(_))));
    assert!(sent.lock().unwrap().is_empty());
    Ok(())
}
