use parley_crypto::PublicKey;
use parley_protocol::types::{GroupName, MessageId, ReactionSymbol, UserId};

use crate::call::CallState;
use crate::store::ConversationRef;

/// Notifications for the UI, published on the session's broadcast channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessageReceived {
        conversation: ConversationRef,
        id: MessageId,
        sender: UserId,
    },
    ReactionUpdated {
        message_id: MessageId,
        reaction: ReactionSymbol,
        user: UserId,
    },
    FileReceived {
        conversation: ConversationRef,
        id: MessageId,
        sender: UserId,
        name: String,
        data: Vec<u8>,
    },
    GroupCreated(GroupName),
    PeerKeyChanged {
        user: UserId,
        previous: PublicKey,
        current: PublicKey,
    },
    CallStateChanged {
        peer: Option<UserId>,
        state: CallState,
    },
    CallFailed {
        peer: UserId,
        reason: String,
    },
    DecryptionFailed {
        from: UserId,
        id: MessageId,
    },
    /// An inbound event that was discarded.
    Rejected {
        event: &'static str,
        reason: String,
    },
    /// Diagnostic text from the relay.
    Status(String),
    Disconnected,
}
