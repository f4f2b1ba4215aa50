//! # Codec
//!
//! Translation between `Val` and the rmipack wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: Encoding and decoding are bounded by a nesting limit
//!   (`MAX_RECURSION_DEPTH` unless the caller supplies one).
//! - **Closed Variants**: The only variant a value may carry is `ref`; any other
//!   name is rejected rather than guessed at.

use rmipack::Decoder;
use rmipack::Encoder;
use rmipack::Tag;

use crate::error::Error;
use crate::error::Result;
use crate::value::RemoteRef;
use crate::value::Val;

/// Default nesting limit for values.
pub const MAX_RECURSION_DEPTH: usize = 64;

const REF_VARIANT: &str = "ref";

/// Encodes a value with the default nesting limit.
pub fn encode_val(enc: &mut Encoder, val: &Val) -> Result<()> {
    encode_val_bounded(enc, val, MAX_RECURSION_DEPTH)
}

/// Encodes a value, failing with `RecursionLimitExceeded` past `max_depth`.
pub fn encode_val_bounded(enc: &mut Encoder, val: &Val, max_depth: usize) -> Result<()> {
    encode_val_impl(enc, val, 0, max_depth)
}

fn encode_val_impl(enc: &mut Encoder, val: &Val, depth: usize, max_depth: usize) -> Result<()> {
    if depth > max_depth {
        return Err(Error::RecursionLimitExceeded(max_depth));
    }

    match val {
        Val::Unit => enc.unit()?,
        Val::Bool(b) => enc.bool(*b)?,
        Val::Int(v) => enc.s64(*v)?,
        Val::Float(v) => enc.f64(*v)?,
        Val::Str(s) => enc.str(s)?,
        Val::Bytes(b) => enc.bytes(b)?,
        Val::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_val_impl(enc, item, depth + 1, max_depth)?;
            }
            enc.list_end()?;
        }
        Val::Map(entries) => {
            enc.map_begin()?;
            for (key, value) in entries {
                enc.variant_begin(key)?;
                encode_val_impl(enc, value, depth + 1, max_depth)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
        }
        Val::Ref(reference) => encode_ref(enc, reference)?,
    }
    Ok(())
}

fn encode_ref(enc: &mut Encoder, reference: &RemoteRef) -> Result<()> {
    enc.variant_begin(REF_VARIANT)?;
    enc.map_begin()?;

    enc.variant_begin("namespace")?;
    enc.str(&reference.namespace)?;
    enc.variant_end()?;

    enc.variant_begin("method")?;
    match &reference.method {
        Some(method) => {
            enc.option_some_begin()?;
            enc.str(method)?;
            enc.option_some_end()?;
        }
        None => enc.option_none()?,
    }
    enc.variant_end()?;

    enc.map_end()?;
    enc.variant_end()?;
    Ok(())
}

/// Decodes a value with the default nesting limit.
pub fn decode_val(dec: &mut Decoder) -> Result<Val> {
    decode_val_bounded(dec, MAX_RECURSION_DEPTH)
}

/// Decodes a value, failing with `RecursionLimitExceeded` past `max_depth`.
pub fn decode_val_bounded(dec: &mut Decoder, max_depth: usize) -> Result<Val> {
    decode_val_impl(dec, 0, max_depth)
}

fn decode_val_impl(dec: &mut Decoder, depth: usize, max_depth: usize) -> Result<Val> {
    if depth > max_depth {
        return Err(Error::RecursionLimitExceeded(max_depth));
    }

    let val = match dec.peek_tag()? {
        Tag::Unit => {
            dec.unit()?;
            Val::Unit
        }
        Tag::BoolTrue | Tag::BoolFalse => Val::Bool(dec.bool()?),
        Tag::S64 => Val::Int(dec.s64()?),
        Tag::F64 => Val::Float(dec.f64()?),
        Tag::String => Val::Str(dec.str()?.to_owned()),
        Tag::Bytes => Val::Bytes(dec.bytes()?.to_vec()),
        Tag::List => {
            let mut list = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = list.next()? {
                items.push(decode_val_impl(&mut item, depth + 1, max_depth)?);
            }
            Val::List(items)
        }
        Tag::Map => {
            let mut map = dec.map()?;
            let mut entries = Vec::new();
            while let Some((key, mut value)) = map.next()? {
                entries.push((key.to_owned(), decode_val_impl(&mut value, depth + 1, max_depth)?));
            }
            Val::Map(entries)
        }
        Tag::Variant => Val::Ref(decode_ref(dec)?),
        tag @ (Tag::Pad | Tag::OptionNone | Tag::OptionSome) => {
            return Err(Error::ProtocolViolation(format!("{:?} is not a value", tag)));
        }
    };
    Ok(val)
}

fn decode_ref(dec: &mut Decoder) -> Result<RemoteRef> {
    let (name, mut body) = dec.variant()?;
    if name != REF_VARIANT {
        return Err(Error::UnknownVariant(name.to_owned()));
    }

    let mut map = body.map()?;
    let mut namespace = None;
    let mut method = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "namespace" => namespace = Some(val.str()?.to_owned()),
            "method" => method = val.option()?.map(|mut m| m.str().map(str::to_owned)).transpose()?,
            _ => val.skip()?,
        }
    }

    Ok(RemoteRef {
        namespace: namespace.ok_or(Error::MissingField("namespace"))?,
        method,
    })
}

/// Encodes a single value into a standalone buffer.
pub fn encode_val_to_bytes(val: &Val) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_val(&mut enc, val)?;
    Ok(enc.into_bytes()?)
}

/// Decodes a standalone buffer holding exactly one value.
pub fn decode_val_from_bytes(bytes: &[u8]) -> Result<Val> {
    let mut dec = Decoder::new(bytes);
    let val = decode_val(&mut dec)?;
    if dec.remaining() != 0 {
        return Err(Error::ProtocolViolation(format!("{} trailing bytes", dec.remaining())));
    }
    Ok(val)
}
