//! # Wire Values
//!
//! `Val` is everything a message can carry: plain structured data, plus
//! `RemoteRef`, the handle that names a namespace (and for callbacks, a method)
//! on the peer that produced it.

use std::fmt;

/// Reference to a namespace owned by one of the two peers.
///
/// `method` is `Some` for callbacks and `None` for remote objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    pub namespace: String,
    pub method: Option<String>,
}

impl RemoteRef {
    pub fn callback(namespace: impl Into<String>, method: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), method: Some(method.into()) }
    }

    pub fn object(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), method: None }
    }

    pub fn is_callback(&self) -> bool {
        self.method.is_some()
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}#{}", self.namespace, method),
            None => write!(f, "{}", self.namespace),
        }
    }
}

/// A dynamically typed wire value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Val {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Val>),
    /// Ordered, string-keyed entries.
    Map(Vec<(String, Val)>),
    Ref(RemoteRef),
}

impl Val {
    /// Short name of the value's shape, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Val::Unit => "unit",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Str(_) => "string",
            Val::Bytes(_) => "bytes",
            Val::List(_) => "list",
            Val::Map(_) => "map",
            Val::Ref(_) => "reference",
        }
    }

    /// Whether a `RemoteRef` appears anywhere inside this value.
    pub fn contains_ref(&self) -> bool {
        match self {
            Val::Ref(_) => true,
            Val::List(items) => items.iter().any(Val::contains_ref),
            Val::Map(entries) => entries.iter().any(|(_, v)| v.contains_ref()),
            _ => false,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Val::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Val::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Val::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Val]> {
        match self {
            Val::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteRef> {
        match self {
            Val::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Looks up the first entry named `key` in a map value.
    pub fn get(&self, key: &str) -> Option<&Val> {
        match self {
            Val::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<()> for Val {
    fn from(_: ()) -> Self {
        Val::Unit
    }
}

impl From<bool> for Val {
    fn from(v: bool) -> Self {
        Val::Bool(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::Int(v)
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::Int(v.into())
    }
}

impl From<u32> for Val {
    fn from(v: u32) -> Self {
        Val::Int(v.into())
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::Float(v)
    }
}

impl From<&str> for Val {
    fn from(v: &str) -> Self {
        Val::Str(v.to_owned())
    }
}

impl From<String> for Val {
    fn from(v: String) -> Self {
        Val::Str(v)
    }
}

impl From<Vec<Val>> for Val {
    fn from(v: Vec<Val>) -> Self {
        Val::List(v)
    }
}

impl From<RemoteRef> for Val {
    fn from(v: RemoteRef) -> Self {
        Val::Ref(v)
    }
}
