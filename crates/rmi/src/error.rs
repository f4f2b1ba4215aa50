//! # Error Definitions
//!
//! Every way a call can fail, grouped by who is at fault:
//!
//! - `Transport`: the channel failed or closed.
//! - `Protocol`: the two peers disagree about namespaces, methods or message shape.
//! - `RemoteExecution`: the peer's method ran and raised an `Exception`.
//! - `Serialization`: an argument does not fit its declared `ParameterType`.
//! - `Exception`: a local handler raised an error; it becomes a `RemoteExecution`
//!   on the calling side.
//!
//! `Error` is `Clone` so one failed instantiation can fail every call queued on it.

use std::backtrace::Backtrace;
use std::backtrace::BacktraceStatus;
use std::fmt;

use rmiwire::Fault;
use rmiwire::FaultCode;

use crate::channel::TransportError;

/// An error raised by a method body, carried across the channel verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    message: String,
    stack: Option<String>,
}

impl Exception {
    /// Creates an exception, capturing a backtrace as its stack when backtraces
    /// are enabled (`RUST_BACKTRACE`).
    pub fn new(message: impl Into<String>) -> Self {
        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
        Self { message: message.into(), stack }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self { message: message.into(), stack: Some(stack.into()) }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Exception {}

impl From<anyhow::Error> for Exception {
    fn from(e: anyhow::Error) -> Self {
        let stack = format!("{:?}", e);
        Self { message: e.to_string(), stack: Some(stack) }
    }
}

/// Inconsistent use of the protocol by either peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnknownNamespace(String),
    UnknownMethod { namespace: String, method: String },
    DuplicateNamespace(String),
    DuplicateMethod { namespace: String, method: String },
    /// A local class is already bound to this id.
    DuplicateClass(String),
    /// A response arrived for a correlation id with no pending call.
    UnmatchedResponse(String),
    /// The target has no namespace bookkeeping and cannot be released.
    Unmanaged,
    /// The namespace was released; no further calls may target it.
    Released(String),
    /// A message or argument could not be decoded.
    Malformed(String),
    /// The peer refused the request; carries the peer's description.
    Rejected(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNamespace(ns) => write!(f, "unknown namespace '{}'", ns),
            Self::UnknownMethod { namespace, method } => {
                write!(f, "unknown method '{}' in namespace '{}'", method, namespace)
            }
            Self::DuplicateNamespace(ns) => write!(f, "namespace '{}' is already registered", ns),
            Self::DuplicateMethod { namespace, method } => {
                write!(f, "method '{}' is already registered in namespace '{}'", method, namespace)
            }
            Self::DuplicateClass(id) => write!(f, "a local class is already registered as '{}'", id),
            Self::UnmatchedResponse(id) => write!(f, "no pending call for correlation id '{}'", id),
            Self::Unmanaged => write!(f, "value has no namespace and cannot be released"),
            Self::Released(ns) => write!(f, "namespace '{}' has been released", ns),
            Self::Malformed(msg) => write!(f, "malformed message: {}", msg),
            Self::Rejected(msg) => write!(f, "rejected by peer: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// An argument or return value that cannot be marshaled as declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError {
    pub namespace: String,
    pub method: String,
    /// Argument position; `None` for the return value or the message as a whole.
    pub position: Option<usize>,
    pub reason: String,
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(
                f,
                "cannot marshal argument {} of {}.{}: {}",
                position, self.namespace, self.method, self.reason
            ),
            None => write!(f, "cannot marshal {}.{}: {}", self.namespace, self.method, self.reason),
        }
    }
}

impl std::error::Error for SerializationError {}

#[derive(Debug, Clone)]
pub enum Error {
    Transport(TransportError),
    Protocol(ProtocolError),
    RemoteExecution(Exception),
    Serialization(SerializationError),
    Exception(Exception),
}

impl Error {
    /// Shorthand for raising an `Exception` from a handler.
    pub fn raise(message: impl Into<String>) -> Self {
        Self::Exception(Exception::new(message))
    }

    /// The wire form of this error, sent back to the caller.
    ///
    /// Exceptions keep their message and stack; a `RemoteExecution` raised by a
    /// nested call passes through unchanged.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::Exception(e) | Self::RemoteExecution(e) => Fault {
                code: FaultCode::Exception,
                message: e.message.clone(),
                stack: e.stack.clone(),
            },
            Self::Protocol(e) => Fault {
                code: FaultCode::Protocol,
                message: e.to_string(),
                stack: None,
            },
            other => Fault {
                code: FaultCode::Exception,
                message: other.to_string(),
                stack: None,
            },
        }
    }

    /// Rebuilds the local error for a fault received from the peer.
    pub fn from_fault(fault: Fault) -> Self {
        match fault.code {
            FaultCode::Exception => Self::RemoteExecution(Exception {
                message: fault.message,
                stack: fault.stack,
            }),
            FaultCode::Protocol => Self::Protocol(ProtocolError::Rejected(fault.message)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::RemoteExecution(e) => write!(f, "Remote execution error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::Exception(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<SerializationError> for Error {
    fn from(e: SerializationError) -> Self {
        Self::Serialization(e)
    }
}

impl From<Exception> for Error {
    fn from(e: Exception) -> Self {
        Self::Exception(e)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::Exception(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
