use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// User identifier: the username handed out by the identity provider.
pub type UserId = String;

/// Group name, already normalized by the sender.
pub type GroupName = String;

/// Sender-assigned message identifier (UUID v4 text form).
pub type MessageId = String;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// One sealed copy of a payload per recipient.
pub type Envelope = BTreeMap<UserId, SealedBytes>;

/// The fixed set of reactions a message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReactionSymbol {
    #[serde(rename = "👍")]
    ThumbsUp,
    #[serde(rename = "👎")]
    ThumbsDown,
    #[serde(rename = "😄")]
    Smile,
    #[serde(rename = "😢")]
    Sad,
    #[serde(rename = "❤️")]
    Heart,
}

impl ReactionSymbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionSymbol::ThumbsUp => "👍",
            ReactionSymbol::ThumbsDown => "👎",
            ReactionSymbol::Smile => "😄",
            ReactionSymbol::Sad => "😢",
            ReactionSymbol::Heart => "❤️",
        }
    }
}

impl fmt::Display for ReactionSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Audio,
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(self) -> bool {
        matches!(self, MediaKind::AudioVideo)
    }
}

/// Opaque negotiation payload (offer, answer or ICE candidate).
/// Relayed verbatim; nothing in this workspace looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalDescriptor(pub serde_json::Value);

/// Sealed payload bytes, base64 on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedBytes(#[serde(with = "b64")] pub Vec<u8>);

impl fmt::Debug for SealedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedBytes({} bytes)", self.0.len())
    }
}

/// 32-byte Curve25519 public key, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyBytes(#[serde(with = "b64")] pub Vec<u8>);

/// Standard base64 (de)serialization for byte fields.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
