use parley_crypto::CryptoError;
use parley_protocol::types::{GroupName, UserId};
use parley_protocol::ProtocolError;
use thiserror::Error;

use crate::media::MediaError;

/// Every failure a session operation can report.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session closed")]
    Closed,
}

/// Illegal transitions and requests the current state cannot honour.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("already in a call with {active}")]
    ConcurrentCall { active: UserId },

    #[error("unexpected answer from {from}: no outgoing call to them")]
    UnexpectedAnswer { from: UserId },

    #[error("call signaling with {peer} timed out")]
    SignalingTimeout { peer: UserId },

    #[error("call was ended before media became available")]
    CallCancelled,

    #[error("group `{0}` already exists")]
    DuplicateGroup(GroupName),

    #[error("invalid group name: {0}")]
    InvalidGroupName(String),

    #[error("no public key known for {0}")]
    UnknownPeer(UserId),
}

/// Devices, entropy and channels the session depends on.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[source] MediaError),

    #[error("call negotiation failed: {0}")]
    Negotiation(#[source] MediaError),

    #[error("entropy source unavailable; refusing to start without a key pair")]
    Entropy,

    #[error("relay channel closed")]
    ChannelClosed,
}
