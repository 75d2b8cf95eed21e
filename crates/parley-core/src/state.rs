use std::time::{SystemTime, UNIX_EPOCH};

use parley_protocol::types::{Timestamp, UserId};

use crate::call::SignalingCoordinator;
use crate::config::SessionConfig;
use crate::groups::GroupDirectory;
use crate::peers::PeerDirectory;
use crate::store::MessageStore;

/// Everything a session knows, apart from its keys.
///
/// Shared behind a `tokio::sync::RwLock`: the session actor is the only
/// writer, UI readers take read guards.
#[derive(Debug)]
pub struct SessionState {
    pub local: UserId,
    pub store: MessageStore,
    pub groups: GroupDirectory,
    pub peers: PeerDirectory,
    pub calls: SignalingCoordinator,
}

impl SessionState {
    pub fn new(local: UserId, config: &SessionConfig) -> Self {
        Self {
            local,
            store: MessageStore::new(),
            groups: GroupDirectory::new(config.max_group_name_len),
            peers: PeerDirectory::new(),
            calls: SignalingCoordinator::new(config.signaling_timeout()),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;

    #[test]
    fn new_state_is_empty() {
        let state = SessionState::new("alice".into(), &SessionConfig::default());
        assert_eq!(state.local, "alice");
        assert!(state.store.is_empty());
        assert!(state.groups.known_groups().is_empty());
        assert!(state.peers.is_empty());
        assert_eq!(state.calls.state(), CallState::Idle);
    }

    #[test]
    fn clock_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
