use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use parley_protocol::types::{MediaKind, UserId};
use serde::Deserialize;

/// Who the local user is, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: UserId,
    pub email: String,
}

impl Identity {
    pub fn new(username: impl Into<UserId>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }
}

/// Session configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Relay address (`host:port`).
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,

    /// How long a call may sit in a pending signaling state before it is dropped.
    #[serde(default = "default_signaling_timeout")]
    pub signaling_timeout_secs: u64,

    /// Period of the expiry / timeout sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Media acquired when answering an incoming call.
    #[serde(default)]
    pub answer_media: MediaKind,

    /// Maximum group name length, in characters.
    #[serde(default = "default_max_group_name_len")]
    pub max_group_name_len: usize,

    /// Capacity of the session mailbox and the outbound event queue.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_relay_addr() -> String {
    "127.0.0.1:7878".into()
}

fn default_signaling_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_max_group_name_len() -> usize {
    32
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            signaling_timeout_secs: default_signaling_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            answer_media: MediaKind::default(),
            max_group_name_len: default_max_group_name_len(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl SessionConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session config: {}", path.display()))?;
        Ok(toml::from_str(&content)?)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
