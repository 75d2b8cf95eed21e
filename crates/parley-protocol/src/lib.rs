//! Parley wire protocol: event types and the newline-delimited JSON codec
//! shared by sessions and the relay.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
