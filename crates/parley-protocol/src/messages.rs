use serde::{Deserialize, Serialize};

use crate::types::*;

/// An encrypted chat message, direct or group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: UserId,
    /// Recipient of a direct message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    /// Target group of a group message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupName>,
    pub content: Envelope,
    pub timestamp: Timestamp,
    /// Absolute expiry instant; 0 means the message never expires.
    #[serde(default)]
    pub expiration_time: Timestamp,
    pub sender_public_key: PublicKeyBytes,
}

/// A reaction to a previously delivered message. Reactions travel in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: MessageId,
    pub reaction: ReactionSymbol,
    pub user: UserId,
}

/// An encrypted file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub id: MessageId,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupName>,
    pub name: String,
    pub data: Envelope,
    pub sender_public_key: PublicKeyBytes,
}

/// Events sent from a session to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// First event on a connection: who we are and how to encrypt for us.
    #[serde(rename_all = "camelCase")]
    Hello {
        user: UserId,
        public_key: PublicKeyBytes,
        protocol_version: u32,
    },

    Message(ChatMessage),

    Reaction(Reaction),

    /// Call signaling addressed to one peer.
    Call { to: UserId, signal: SignalDescriptor },

    CreateGroup { name: GroupName },

    JoinGroup { name: GroupName },

    File(FileTransfer),
}

/// Events delivered by the relay to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RelayEvent {
    /// A user's current public key.
    #[serde(rename_all = "camelCase")]
    PeerKey {
        user: UserId,
        public_key: PublicKeyBytes,
    },

    Message(ChatMessage),

    Reaction(Reaction),

    /// Call signaling from one peer.
    Call { from: UserId, signal: SignalDescriptor },

    GroupCreated { name: GroupName },

    File(FileTransfer),

    /// Relay diagnostics (rejections, join notices).
    Status { msg: String },
}

impl ClientEvent {
    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Hello { .. } => "hello",
            ClientEvent::Message(_) => "message",
            ClientEvent::Reaction(_) => "reaction",
            ClientEvent::Call { .. } => "call",
            ClientEvent::CreateGroup { .. } => "createGroup",
            ClientEvent::JoinGroup { .. } => "joinGroup",
            ClientEvent::File(_) => "file",
        }
    }
}

impl RelayEvent {
    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::PeerKey { .. } => "peerKey",
            RelayEvent::Message(_) => "message",
            RelayEvent::Reaction(_) => "reaction",
            RelayEvent::Call { .. } => "call",
            RelayEvent::GroupCreated { .. } => "groupCreated",
            RelayEvent::File(_) => "file",
            RelayEvent::Status { .. } => "status",
        }
    }
}
