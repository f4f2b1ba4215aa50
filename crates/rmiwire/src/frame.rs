//! # Protocol Frames
//!
//! The envelope of every message: a top-level variant naming the kind
//! (`request`, `response`, `error`) around a map of header fields and payload.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown map entries are skipped.
//! - **Recoverable Headers**: `decode_header` reads the header even when the
//!   payload is malformed, so a bad request can still be answered.

use rmipack::Decoder;
use rmipack::Encoder;

use crate::codec::decode_val_bounded;
use crate::codec::encode_val_bounded;
use crate::error::Error;
use crate::error::Result;
use crate::value::Val;

/// What a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Error,
}

impl Kind {
    pub fn as_tag(self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Error => "error",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "request" => Ok(Kind::Request),
            "response" => Ok(Kind::Response),
            "error" => Ok(Kind::Error),
            other => Err(Error::UnknownVariant(format!("frame kind: {}", other))),
        }
    }
}

/// Addressing shared by all frame kinds.
///
/// Responses echo the header of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Correlation id, unique among the sender's outstanding calls.
    pub id: String,
    pub namespace: String,
    pub method: String,
}

impl Header {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, method: impl Into<String>) -> Self {
        Self { id: id.into(), namespace: namespace.into(), method: method.into() }
    }
}

/// Who is to blame for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// The invoked method raised an error.
    Exception,
    /// The request could not be dispatched.
    Protocol,
}

impl FaultCode {
    fn as_tag(self) -> &'static str {
        match self {
            FaultCode::Exception => "exception",
            FaultCode::Protocol => "protocol",
        }
    }

    fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "exception" => Ok(FaultCode::Exception),
            "protocol" => Ok(FaultCode::Protocol),
            other => Err(Error::UnknownVariant(format!("fault code: {}", other))),
        }
    }
}

/// Error payload, reproduced verbatim on the calling side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request { args: Vec<Val> },
    Response { result: Val },
    Error { fault: Fault },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Body,
}

impl Frame {
    pub fn request(header: Header, args: Vec<Val>) -> Self {
        Self { header, body: Body::Request { args } }
    }

    pub fn response(header: Header, result: Val) -> Self {
        Self { header, body: Body::Response { result } }
    }

    pub fn error(header: Header, fault: Fault) -> Self {
        Self { header, body: Body::Error { fault } }
    }

    pub fn kind(&self) -> Kind {
        match self.body {
            Body::Request { .. } => Kind::Request,
            Body::Response { .. } => Kind::Response,
            Body::Error { .. } => Kind::Error,
        }
    }

    /// Encode this frame into the encoder.
    pub fn encode(&self, enc: &mut Encoder, max_depth: usize) -> Result<()> {
        enc.variant_begin(self.kind().as_tag())?;
        enc.map_begin()?;

        write_map_str(enc, "id", &self.header.id)?;
        write_map_str(enc, "namespace", &self.header.namespace)?;
        write_map_str(enc, "method", &self.header.method)?;

        match &self.body {
            Body::Request { args } => {
                enc.variant_begin("args")?;
                enc.list_begin()?;
                for arg in args {
                    encode_val_bounded(enc, arg, max_depth)?;
                }
                enc.list_end()?;
                enc.variant_end()?;
            }
            Body::Response { result } => {
                enc.variant_begin("result")?;
                encode_val_bounded(enc, result, max_depth)?;
                enc.variant_end()?;
            }
            Body::Error { fault } => {
                enc.variant_begin("fault")?;
                encode_fault(enc, fault)?;
                enc.variant_end()?;
            }
        }

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    pub fn to_bytes(&self, max_depth: usize) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc, max_depth)?;
        Ok(enc.into_bytes()?)
    }

    /// Decode a complete frame.
    pub fn decode(bytes: &[u8], max_depth: usize) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, fields) = read_fields(&mut dec)?;
        let header = fields.header()?;

        let body = match kind {
            Kind::Request => {
                let mut payload = fields.payload.ok_or(Error::MissingField("args"))?;
                let mut list = payload.list()?;
                let mut args = Vec::new();
                while let Some(mut item) = list.next()? {
                    args.push(decode_val_bounded(&mut item, max_depth)?);
                }
                Body::Request { args }
            }
            Kind::Response => {
                let mut payload = fields.payload.ok_or(Error::MissingField("result"))?;
                Body::Response { result: decode_val_bounded(&mut payload, max_depth)? }
            }
            Kind::Error => {
                let mut payload = fields.payload.ok_or(Error::MissingField("fault"))?;
                Body::Error { fault: decode_fault(&mut payload)? }
            }
        };

        if dec.remaining() != 0 {
            return Err(Error::ProtocolViolation(format!("{} trailing bytes", dec.remaining())));
        }

        Ok(Frame { header, body })
    }
}

/// Decodes just the kind and header of a raw frame.
/// Useful for answering or routing a frame whose payload fails to decode.
pub fn decode_header(bytes: &[u8]) -> Result<(Kind, Header)> {
    let mut dec = Decoder::new(bytes);
    let (kind, fields) = read_fields(&mut dec)?;
    Ok((kind, fields.header()?))
}

struct Fields<'a> {
    id: Option<&'a str>,
    namespace: Option<&'a str>,
    method: Option<&'a str>,
    payload: Option<Decoder<'a>>,
}

impl Fields<'_> {
    fn header(&self) -> Result<Header> {
        Ok(Header::new(
            self.id.ok_or(Error::MissingField("id"))?,
            self.namespace.ok_or(Error::MissingField("namespace"))?,
            self.method.ok_or(Error::MissingField("method"))?,
        ))
    }
}

fn read_fields<'a>(dec: &mut Decoder<'a>) -> Result<(Kind, Fields<'a>)> {
    let (tag, mut body) = dec.variant()?;
    let kind = Kind::from_tag(tag)?;
    let payload_key = match kind {
        Kind::Request => "args",
        Kind::Response => "result",
        Kind::Error => "fault",
    };

    let mut map = body.map()?;
    let mut fields = Fields { id: None, namespace: None, method: None, payload: None };

    while let Some((key, mut val)) = map.next()? {
        match key {
            "id" => fields.id = Some(val.str()?),
            "namespace" => fields.namespace = Some(val.str()?),
            "method" => fields.method = Some(val.str()?),
            k if k == payload_key => fields.payload = Some(val),
            _ => val.skip()?,
        }
    }

    Ok((kind, fields))
}

fn encode_fault(enc: &mut Encoder, fault: &Fault) -> Result<()> {
    enc.map_begin()?;
    write_map_str(enc, "code", fault.code.as_tag())?;
    write_map_str(enc, "message", &fault.message)?;

    enc.variant_begin("stack")?;
    match &fault.stack {
        Some(stack) => {
            enc.option_some_begin()?;
            enc.str(stack)?;
            enc.option_some_end()?;
        }
        None => enc.option_none()?,
    }
    enc.variant_end()?;

    enc.map_end()?;
    Ok(())
}

fn decode_fault(dec: &mut Decoder) -> Result<Fault> {
    let mut map = dec.map()?;
    let mut code = None;
    let mut message = None;
    let mut stack = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "code" => code = Some(FaultCode::from_tag(val.str()?)?),
            "message" => message = Some(val.str()?.to_owned()),
            "stack" => stack = val.option()?.map(|mut s| s.str().map(str::to_owned)).transpose()?,
            _ => val.skip()?,
        }
    }

    Ok(Fault {
        code: code.ok_or(Error::MissingField("code"))?,
        message: message.ok_or(Error::MissingField("message"))?,
        stack,
    })
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}
