use rmipack::Decoder;
use rmipack::Encoder;

use crate::*;

fn sample() -> Val {
    Val::Map(vec![
        ("name".into(), Val::from("dog")),
        ("age".into(), Val::Int(-3)),
        ("weight".into(), Val::Float(12.5)),
        ("tags".into(), Val::List(vec![Val::Bool(true), Val::Unit, Val::Bytes(vec![9, 8])])),
    ])
}

// ============================================================================
//  VALUES
// ============================================================================

#[test]
fn test_structured_value_roundtrip() -> anyhow::Result<()> {
    let val = sample();
    let bytes = encode_val_to_bytes(&val)?;
    assert_eq!(decode_val_from_bytes(&bytes)?, val);
    Ok(())
}

#[test]
fn test_map_preserves_entry_order() -> anyhow::Result<()> {
    let val = Val::Map(vec![("z".into(), Val::Int(1)), ("a".into(), Val::Int(2))]);
    let decoded = decode_val_from_bytes(&encode_val_to_bytes(&val)?)?;
    let Val::Map(entries) = decoded else { panic!("expected a map") };
    assert_eq!(entries[0].0, "z");
    assert_eq!(entries[1].0, "a");
    Ok(())
}

#[test]
fn test_references_roundtrip() -> anyhow::Result<()> {
    let val = Val::List(vec![
        Val::Ref(RemoteRef::callback("local:1f", "callback")),
        Val::Ref(RemoteRef::object("remote:2e")),
    ]);
    let decoded = decode_val_from_bytes(&encode_val_to_bytes(&val)?)?;
    assert_eq!(decoded, val);
    assert!(decoded.contains_ref());
    Ok(())
}

#[test]
fn test_contains_ref_looks_through_nesting() {
    assert!(!sample().contains_ref());
    let nested = Val::Map(vec![(
        "inner".into(),
        Val::List(vec![Val::Int(1), Val::Ref(RemoteRef::object("ns"))]),
    )]);
    assert!(nested.contains_ref());
}

#[test]
fn test_accessors() {
    let val = sample();
    assert_eq!(val.get("name").and_then(Val::as_str), Some("dog"));
    assert_eq!(val.get("age").and_then(Val::as_int), Some(-3));
    assert_eq!(val.get("missing"), None);
    assert_eq!(val.kind(), "map");
    assert_eq!(Val::from(()).kind(), "unit");
}

#[test]
fn test_unknown_variant_is_rejected() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("closure")?;
    enc.unit()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    match decode_val_from_bytes(&bytes) {
        Err(Error::UnknownVariant(name)) => assert_eq!(name, "closure"),
        other => panic!("unexpected: {:?}", other),
    }
    Ok(())
}

#[test]
fn test_trailing_bytes_are_rejected() -> anyhow::Result<()> {
    let mut bytes = encode_val_to_bytes(&Val::Int(1))?;
    bytes.push(rmipack::Tag::Unit as u8);
    assert!(matches!(decode_val_from_bytes(&bytes), Err(Error::ProtocolViolation(_))));
    Ok(())
}

fn nested(depth: usize) -> Val {
    let mut val = Val::Unit;
    for _ in 0..depth {
        val = Val::List(vec![val]);
    }
    val
}

#[test]
fn test_encode_recursion_limit() {
    let mut enc = Encoder::new();
    assert_eq!(
        encode_val_bounded(&mut enc, &nested(5), 4),
        Err(Error::RecursionLimitExceeded(4))
    );

    let mut enc = Encoder::new();
    assert!(encode_val_bounded(&mut enc, &nested(4), 4).is_ok());
}

#[test]
fn test_decode_recursion_limit() -> anyhow::Result<()> {
    let bytes = encode_val_to_bytes(&nested(10))?;
    let mut dec = Decoder::new(&bytes);
    assert_eq!(decode_val_bounded(&mut dec, 3), Err(Error::RecursionLimitExceeded(3)));

    let mut dec = Decoder::new(&bytes);
    assert_eq!(decode_val_bounded(&mut dec, 10)?, nested(10));
    Ok(())
}

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn test_request_frame_roundtrip() -> anyhow::Result<()> {
    let frame = Frame::request(
        Header::new("7", "global", "download"),
        vec![Val::from("http://url"), Val::Ref(RemoteRef::callback("a:1", "callback"))],
    );
    let bytes = frame.to_bytes(MAX_RECURSION_DEPTH)?;
    let decoded = Frame::decode(&bytes, MAX_RECURSION_DEPTH)?;
    assert_eq!(decoded, frame);
    assert_eq!(decoded.kind(), Kind::Request);
    Ok(())
}

#[test]
fn test_response_and_error_frames() -> anyhow::Result<()> {
    let header = Header::new("8", "b:ff", "getType");

    let ok = Frame::response(header.clone(), Val::from("dog"));
    assert_eq!(Frame::decode(&ok.to_bytes(8)?, 8)?, ok);

    let fault = Fault {
        code: FaultCode::Exception,
        message: "error-message".into(),
        stack: Some("at getType (dog.rs:3)".into()),
    };
    let err = Frame::error(header.clone(), fault.clone());
    let decoded = Frame::decode(&err.to_bytes(8)?, 8)?;
    assert_eq!(decoded.body, Body::Error { fault });

    let bare = Frame::error(
        header,
        Fault { code: FaultCode::Protocol, message: "unknown namespace".into(), stack: None },
    );
    assert_eq!(Frame::decode(&bare.to_bytes(8)?, 8)?, bare);
    Ok(())
}

#[test]
fn test_unknown_header_fields_are_skipped() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("response")?;
    enc.map_begin()?;
    for (k, v) in [("id", "3"), ("trace", "abc"), ("namespace", "global"), ("method", "m")] {
        enc.variant_begin(k)?;
        enc.str(v)?;
        enc.variant_end()?;
    }
    enc.variant_begin("result")?;
    enc.s64(5)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;

    let frame = Frame::decode(&enc.into_bytes()?, 8)?;
    assert_eq!(frame.header, Header::new("3", "global", "m"));
    assert_eq!(frame.body, Body::Response { result: Val::Int(5) });
    Ok(())
}

#[test]
fn test_missing_payload_is_reported() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("request")?;
    enc.map_begin()?;
    for (k, v) in [("id", "1"), ("namespace", "global"), ("method", "m")] {
        enc.variant_begin(k)?;
        enc.str(v)?;
        enc.variant_end()?;
    }
    enc.map_end()?;
    enc.variant_end()?;

    let bytes = enc.into_bytes()?;
    assert_eq!(Frame::decode(&bytes, 8), Err(Error::MissingField("args")));
    // The header is still readable.
    assert_eq!(decode_header(&bytes)?, (Kind::Request, Header::new("1", "global", "m")));
    Ok(())
}

#[test]
fn test_header_survives_oversized_payload() -> anyhow::Result<()> {
    let frame = Frame::request(Header::new("9", "ns", "deep"), vec![nested(20)]);
    let bytes = frame.to_bytes(64)?;

    assert_eq!(Frame::decode(&bytes, 8), Err(Error::RecursionLimitExceeded(8)));
    let (kind, header) = decode_header(&bytes)?;
    assert_eq!(kind, Kind::Request);
    assert_eq!(header.id, "9");
    Ok(())
}

#[test]
fn test_unknown_frame_kind() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("notify")?;
    enc.map_begin()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;
    assert!(matches!(decode_header(&bytes), Err(Error::UnknownVariant(_))));
    Ok(())
}
