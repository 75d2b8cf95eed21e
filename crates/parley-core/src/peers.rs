use std::collections::HashMap;

use parley_crypto::PublicKey;
use parley_protocol::types::UserId;
use tracing::{info, warn};

/// What learning a key did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdate {
    New,
    Unchanged,
    /// The user already had a different key, which has been replaced.
    Changed { previous: PublicKey },
}

/// Public keys of other users, trusted on first use.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    keys: HashMap<UserId, PublicKey>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&mut self, user: &str, key: PublicKey) -> KeyUpdate {
        match self.keys.insert(user.to_string(), key) {
            None => {
                info!(user, key = %key.fingerprint(), "learned peer key");
                KeyUpdate::New
            }
            Some(previous) if previous == key => KeyUpdate::Unchanged,
            Some(previous) => {
                warn!(
                    user,
                    old = %previous.fingerprint(),
                    new = %key.fingerprint(),
                    "peer key changed"
                );
                KeyUpdate::Changed { previous }
            }
        }
    }

    pub fn key_of(&self, user: &str) -> Option<&PublicKey> {
        self.keys.get(user)
    }

    /// Every known user except `local`, with their keys.
    pub fn others<'a>(&'a self, local: &'a str) -> impl Iterator<Item = (&'a UserId, &'a PublicKey)> {
        self.keys.iter().filter(move |(user, _)| user.as_str() != local)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
