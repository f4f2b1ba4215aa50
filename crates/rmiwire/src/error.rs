//! # Error Definitions
//!
//! Failures while turning values and frames into bytes and back.

use rmipack::Error as PackError;

/// Encoding and decoding failures of the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying rmipack encoding failed.
    Pack(PackError),
    /// An unknown variant name was found where a closed set was expected.
    UnknownVariant(String),
    /// A frame was missing a required field.
    MissingField(&'static str),
    /// The frame structure does not match the protocol.
    ProtocolViolation(String),
    /// Values nested deeper than the configured limit.
    RecursionLimitExceeded(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pack(e) => write!(f, "encoding error: {}", e),
            Self::UnknownVariant(name) => write!(f, "unknown variant '{}'", name),
            Self::MissingField(name) => write!(f, "missing field '{}'", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::RecursionLimitExceeded(limit) => {
                write!(f, "value nesting exceeds the limit of {}", limit)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        Self::Pack(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
