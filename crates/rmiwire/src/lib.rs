//! # Rmiwire
//!
//! Values and frames exchanged by two RMI peers.
//!
//! A message is one rmipack buffer holding a single frame. Requests carry a list
//! of argument values, responses a single result value, and errors a `Fault`
//! with the message and stack of the failure. Callbacks and remote objects
//! travel as `RemoteRef` values; what they resolve to is decided by the receiver.

mod codec;
mod error;
mod frame;
mod value;

pub use codec::MAX_RECURSION_DEPTH;
pub use codec::decode_val;
pub use codec::decode_val_bounded;
pub use codec::decode_val_from_bytes;
pub use codec::encode_val;
pub use codec::encode_val_bounded;
pub use codec::encode_val_to_bytes;
pub use error::Error;
pub use error::Result;
pub use frame::Body;
pub use frame::Fault;
pub use frame::FaultCode;
pub use frame::Frame;
pub use frame::Header;
pub use frame::Kind;
pub use frame::decode_header;
pub use value::RemoteRef;
pub use value::Val;

#[cfg(test)]
mod tests;
