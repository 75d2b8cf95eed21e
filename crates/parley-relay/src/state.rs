use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use parley_protocol::types::{GroupName, PublicKeyBytes, UserId};

use crate::config::RelayConfig;

/// Longest accepted username, in characters.
pub const MAX_USERNAME_LEN: usize = 32;

/// Simple token-bucket rate limiter.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns true if allowed, false if rate-limited.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One connected user as the relay sees it.
pub struct Peer {
    /// Sender for pushing encoded lines to this user's writer task.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Public key announced in the hello. Opaque to the relay.
    pub public_key: PublicKeyBytes,
    /// Group the user is currently joined to.
    pub group: Option<GroupName>,
    /// Limits messages and file transfers.
    pub message_rate: RateLimiter,
}

/// Shared relay state.
pub struct RelayState {
    pub peers: DashMap<UserId, Peer>,
    pub groups: RwLock<BTreeSet<GroupName>>,
    pub max_users: u32,
    pub max_group_name_len: usize,
    /// Admitted users, reserved while the peer entry is still locked.
    online: AtomicU32,
    message_burst: f64,
    message_rate: f64,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            peers: DashMap::new(),
            groups: RwLock::new(BTreeSet::new()),
            max_users: config.max_users,
            online: AtomicU32::new(0),
            max_group_name_len: config.max_group_name_len,
            message_burst: config.message_burst.max(1.0),
            message_rate: config.message_rate_per_sec.max(0.0),
        }
    }

    pub fn user_count(&self) -> usize {
        self.peers.len()
    }

    /// Admit a user under `username`. Returns the canonical name and every
    /// key already known, so the caller can introduce the newcomer.
    pub fn register(
        &self,
        username: &str,
        public_key: PublicKeyBytes,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> anyhow::Result<(UserId, Vec<(UserId, PublicKeyBytes)>)> {
        let username = username.trim();
        if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
            anyhow::bail!("username must be 1-{} characters", MAX_USERNAME_LEN);
        }
        if username.chars().any(|c| c.is_control()) {
            anyhow::bail!("username contains invalid characters");
        }
        if public_key.0.is_empty() {
            anyhow::bail!("hello carried no public key");
        }
        let known = self
            .peers
            .iter()
            .map(|p| (p.key().clone(), p.public_key.clone()))
            .collect();

        match self.peers.entry(username.to_string()) {
            Entry::Occupied(_) => anyhow::bail!("username `{}` is already taken", username),
            Entry::Vacant(slot) => {
                let max = self.max_users;
                let reserved = self
                    .online
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    });
                if reserved.is_err() {
                    anyhow::bail!("relay is full");
                }
                slot.insert(Peer {
                    tx,
                    public_key,
                    group: None,
                    message_rate: RateLimiter::new(self.message_burst, self.message_rate),
                });
            }
        }
        Ok((username.to_string(), known))
    }

    pub fn remove(&self, user: &str) -> Option<Peer> {
        let (_, peer) = self.peers.remove(user)?;
        self.online.fetch_sub(1, Ordering::SeqCst);
        Some(peer)
    }

    /// Returns false when the user has exhausted their message budget.
    pub fn try_consume_message(&self, user: &str) -> bool {
        self.peers
            .get_mut(user)
            .map(|mut p| p.message_rate.try_consume())
            .unwrap_or(false)
    }

    pub fn public_key_of(&self, user: &str) -> Option<PublicKeyBytes> {
        self.peers.get(user).map(|p| p.public_key.clone())
    }

    pub fn sender_of(&self, user: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.peers.get(user).map(|p| p.tx.clone())
    }

    /// Senders of every connected user, optionally skipping one.
    pub fn senders_except(&self, exclude: Option<&str>) -> Vec<mpsc::Sender<Vec<u8>>> {
        self.peers
            .iter()
            .filter(|p| Some(p.key().as_str()) != exclude)
            .map(|p| p.tx.clone())
            .collect()
    }

    /// Senders of users currently joined to `group`, skipping `exclude`.
    pub fn group_senders(&self, group: &str, exclude: &str) -> Vec<mpsc::Sender<Vec<u8>>> {
        self.peers
            .iter()
            .filter(|p| p.key() != exclude && p.group.as_deref() == Some(group))
            .map(|p| p.tx.clone())
            .collect()
    }

    /// Collapse whitespace runs and check the name is usable.
    pub fn normalize_group_name(&self, raw: &str) -> anyhow::Result<GroupName> {
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            anyhow::bail!("group name must not be empty");
        }
        if name.chars().count() > self.max_group_name_len {
            anyhow::bail!(
                "group name must be at most {} characters",
                self.max_group_name_len
            );
        }
        if name.chars().any(|c| c.is_control()) {
            anyhow::bail!("group name contains invalid characters");
        }
        Ok(name)
    }

    /// Register a new group. Fails if the normalized name already exists.
    pub async fn create_group(&self, raw: &str) -> anyhow::Result<GroupName> {
        let name = self.normalize_group_name(raw)?;
        let mut groups = self.groups.write().await;
        if !groups.insert(name.clone()) {
            anyhow::bail!("a group named `{}` already exists", name);
        }
        Ok(name)
    }

    /// Move `user` into `raw`, creating the group if nobody has yet.
    /// Returns the group name and whether it was created by this call.
    pub async fn join_group(&self, user: &str, raw: &str) -> anyhow::Result<(GroupName, bool)> {
        let name = self.normalize_group_name(raw)?;
        let created = self.groups.write().await.insert(name.clone());
        match self.peers.get_mut(user) {
            Some(mut peer) => peer.group = Some(name.clone()),
            None => anyhow::bail!("unknown user `{}`", user),
        }
        Ok((name, created))
    }

    pub async fn group_list(&self) -> Vec<GroupName> {
        self.groups.read().await.iter().cloned().collect()
    }
}
