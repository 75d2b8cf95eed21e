//! In-memory message log, one arrival-ordered list per conversation.
//!
//! Expiry is enforced at read time: a message whose `expires_at` is at or
//! before `now` never comes out of [`MessageStore::visible_messages`], whether
//! or not the sweep has evicted it yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parley_crypto::{CryptoError, KeyVault, PublicKey};
use parley_protocol::messages::Reaction;
use parley_protocol::types::{GroupName, MessageId, ReactionSymbol, Timestamp, UserId};
use tracing::debug;

/// Which conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationRef {
    Direct(UserId),
    Group(GroupName),
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationRef::Direct(peer) => write!(f, "@{peer}"),
            ConversationRef::Group(name) => write!(f, "#{name}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Our own outgoing text, or an inbound payload we opened.
    Plaintext(String),
    /// Wire form, not yet opened.
    Sealed(Vec<u8>),
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Plaintext(text) => write!(f, "Plaintext({} chars)", text.chars().count()),
            MessageBody::Sealed(bytes) => write!(f, "Sealed({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub conversation: ConversationRef,
    pub body: MessageBody,
    pub sender_public_key: PublicKey,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub reactions: BTreeMap<ReactionSymbol, BTreeSet<UserId>>,
}

impl Message {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// The text, once the body has been opened.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Plaintext(text) => Some(text),
            MessageBody::Sealed(_) => None,
        }
    }

    /// Replace a sealed body with its plaintext. A body that is already
    /// plaintext is left alone.
    pub fn open(&mut self, vault: &KeyVault) -> Result<(), CryptoError> {
        if let MessageBody::Sealed(sealed) = &self.body {
            let text = vault.open_text(sealed, &self.sender_public_key)?;
            self.body = MessageBody::Plaintext(text);
        }
        Ok(())
    }

    /// Users who reacted with `symbol`.
    pub fn reactors(&self, symbol: ReactionSymbol) -> impl Iterator<Item = &UserId> {
        self.reactions.get(&symbol).into_iter().flatten()
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationRef, Vec<Message>>,
    /// Message id to the conversation holding it.
    index: HashMap<MessageId, ConversationRef>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message at the end of its conversation.
    ///
    /// Returns `false` when a message with the same id is already stored.
    pub fn append(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            debug!(id = %message.id, "duplicate message ignored");
            return false;
        }
        self.index
            .insert(message.id.clone(), message.conversation.clone());
        self.conversations
            .entry(message.conversation.clone())
            .or_default()
            .push(message);
        true
    }

    /// Add the reactor to the reaction set. Returns whether the set changed;
    /// an unknown message id is not an error.
    pub fn apply_reaction(&mut self, event: &Reaction) -> bool {
        let Some(message) = self.get_mut(&event.message_id) else {
            debug!(id = %event.message_id, "reaction for unknown message dropped");
            return false;
        };
        message
            .reactions
            .entry(event.reaction)
            .or_default()
            .insert(event.user.clone())
    }

    /// Unexpired messages of `conversation`, oldest first. Equal timestamps
    /// keep arrival order.
    pub fn visible_messages(
        &self,
        conversation: &ConversationRef,
        now: Timestamp,
    ) -> Vec<&Message> {
        let mut visible: Vec<&Message> = self
            .conversations
            .get(conversation)
            .map(|log| log.iter().filter(|m| !m.is_expired(now)).collect())
            .unwrap_or_default();
        visible.sort_by_key(|m| m.timestamp);
        visible
    }

    /// Drop every expired message. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let mut removed = 0;
        let index = &mut self.index;
        for log in self.conversations.values_mut() {
            log.retain(|m| {
                if m.is_expired(now) {
                    index.remove(&m.id);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        self.conversations.retain(|_, log| !log.is_empty());
        removed
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        let conversation = self.index.get(id)?;
        self.conversations
            .get(conversation)?
            .iter()
            .find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let conversation = self.index.get(id)?;
        self.conversations
            .get_mut(conversation)?
            .iter_mut()
            .find(|m| m.id == id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationRef> {
        self.conversations.keys()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
