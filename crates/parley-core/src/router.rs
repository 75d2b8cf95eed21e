//! Translation between relay events and session state.
//!
//! Inbound, [`EventRouter::dispatch`] opens what needs opening and hands
//! the result to the store, the directories or the call coordinator.
//! Outbound, each `send_*` method updates local state and returns exactly
//! one [`ClientEvent`] for the caller to put on the channel.

use std::collections::BTreeMap;
use std::time::Instant;

use parley_crypto::{KeyVault, PublicKey};
use parley_protocol::codec::{encode_client_event, MAX_LINE_SIZE, PROTOCOL_VERSION};
use parley_protocol::messages::{ChatMessage, ClientEvent, FileTransfer, Reaction, RelayEvent};
use parley_protocol::types::{
    Envelope, GroupName, MediaKind, MessageId, PublicKeyBytes, ReactionSymbol, SealedBytes,
    SignalDescriptor, Timestamp, UserId,
};
use parley_protocol::ProtocolError;
use tracing::{debug, info, warn};

use crate::call::CallAction;
use crate::error::{SessionError, StateError};
use crate::events::SessionEvent;
use crate::peers::KeyUpdate;
use crate::state::SessionState;
use crate::store::{ConversationRef, Message, MessageBody};

/// What an inbound event produced.
#[derive(Debug, Default)]
pub struct Routed {
    pub events: Vec<SessionEvent>,
    pub actions: Vec<CallAction>,
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    answer_media: MediaKind,
}

impl EventRouter {
    pub fn new(answer_media: MediaKind) -> Self {
        Self { answer_media }
    }

    /// Apply one inbound event. An `Err` means the event was discarded;
    /// state is unchanged and later events can still be dispatched.
    pub fn dispatch(
        &self,
        event: RelayEvent,
        state: &mut SessionState,
        vault: &KeyVault,
        now: Instant,
    ) -> Result<Routed, SessionError> {
        let mut routed = Routed::default();
        match event {
            RelayEvent::PeerKey { user, public_key } => {
                if user != state.local {
                    let key = PublicKey::from_bytes(&public_key.0)?;
                    learn_key(state, &user, key, &mut routed);
                }
            }
            RelayEvent::Message(msg) => self.on_message(msg, state, vault, &mut routed)?,
            RelayEvent::Reaction(reaction) => {
                if state.store.apply_reaction(&reaction) {
                    routed.events.push(SessionEvent::ReactionUpdated {
                        message_id: reaction.message_id,
                        reaction: reaction.reaction,
                        user: reaction.user,
                    });
                }
            }
            RelayEvent::Call { from, signal } => {
                routed.actions =
                    state
                        .calls
                        .on_remote_signal(&from, signal, self.answer_media, now)?;
            }
            RelayEvent::GroupCreated { name } => record_group(state, &name, &mut routed),
            RelayEvent::File(file) => self.on_file(file, state, vault, &mut routed)?,
            RelayEvent::Status { msg } => {
                info!(status = %msg, "relay status");
                routed.events.push(SessionEvent::Status(msg));
            }
        }
        Ok(routed)
    }

    fn on_message(
        &self,
        msg: ChatMessage,
        state: &mut SessionState,
        vault: &KeyVault,
        routed: &mut Routed,
    ) -> Result<(), SessionError> {
        if msg.sender == state.local {
            debug!(id = %msg.id, "own message echoed back");
            return Ok(());
        }
        let sender_key = PublicKey::from_bytes(&msg.sender_public_key.0)?;
        let sealed = own_entry(msg.content, &state.local, "content")?;
        let conversation = inbound_conversation(state, &msg.sender, msg.group.as_deref());

        let mut message = Message {
            id: msg.id,
            sender: msg.sender,
            conversation,
            body: MessageBody::Sealed(sealed),
            sender_public_key: sender_key,
            timestamp: msg.timestamp,
            expires_at: (msg.expiration_time != 0).then_some(msg.expiration_time),
            reactions: BTreeMap::new(),
        };
        if let Err(e) = message.open(vault) {
            warn!(from = %message.sender, id = %message.id, "failed to decrypt message: {e}");
            routed.events.push(SessionEvent::DecryptionFailed {
                from: message.sender,
                id: message.id,
            });
            return Ok(());
        }
        learn_key(state, &message.sender, sender_key, routed);
        record_conversation(state, &message.conversation, routed);

        let event = SessionEvent::MessageReceived {
            conversation: message.conversation.clone(),
            id: message.id.clone(),
            sender: message.sender.clone(),
        };
        if state.store.append(message) {
            routed.events.push(event);
        }
        Ok(())
    }

    fn on_file(
        &self,
        file: FileTransfer,
        state: &mut SessionState,
        vault: &KeyVault,
        routed: &mut Routed,
    ) -> Result<(), SessionError> {
        if file.sender == state.local {
            return Ok(());
        }
        let sender_key = PublicKey::from_bytes(&file.sender_public_key.0)?;
        let sealed = own_entry(file.data, &state.local, "data")?;
        let conversation = inbound_conversation(state, &file.sender, file.group.as_deref());

        match vault.open(&sealed, &sender_key) {
            Ok(data) => {
                learn_key(state, &file.sender, sender_key, routed);
                record_conversation(state, &conversation, routed);
                info!(from = %file.sender, name = %file.name, bytes = data.len(), "file received");
                routed.events.push(SessionEvent::FileReceived {
                    conversation,
                    id: file.id,
                    sender: file.sender,
                    name: file.name,
                    data,
                });
            }
            Err(e) => {
                warn!(from = %file.sender, id = %file.id, "failed to decrypt file: {e}");
                routed.events.push(SessionEvent::DecryptionFailed {
                    from: file.sender,
                    id: file.id,
                });
            }
        }
        Ok(())
    }

    /// First event on a new connection.
    pub fn hello(&self, state: &SessionState, vault: &KeyVault) -> ClientEvent {
        ClientEvent::Hello {
            user: state.local.clone(),
            public_key: PublicKeyBytes(vault.public_key().to_vec()),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Seal `text` for every recipient of `to` and keep a plaintext copy.
    pub fn send_message(
        &self,
        state: &mut SessionState,
        vault: &KeyVault,
        to: ConversationRef,
        text: &str,
        expires_at: Option<Timestamp>,
        now_ms: Timestamp,
    ) -> Result<(ClientEvent, MessageId), SessionError> {
        let to = outbound_conversation(state, to)?;
        let content = seal_for(state, vault, &to, text.as_bytes())?;
        let id = new_id();
        let (direct, group) = split(&to);

        let event = ClientEvent::Message(ChatMessage {
            id: id.clone(),
            sender: state.local.clone(),
            to: direct,
            group,
            content,
            timestamp: now_ms,
            expiration_time: expires_at.unwrap_or(0),
            sender_public_key: PublicKeyBytes(vault.public_key().to_vec()),
        });
        check_line_size(&event)?;

        state.store.append(Message {
            id: id.clone(),
            sender: state.local.clone(),
            conversation: to,
            body: MessageBody::Plaintext(text.to_string()),
            sender_public_key: vault.public_key(),
            timestamp: now_ms,
            expires_at,
            reactions: BTreeMap::new(),
        });
        Ok((event, id))
    }

    /// React to a message. Applied locally right away; the relay does not
    /// echo reactions back to their author.
    pub fn send_reaction(
        &self,
        state: &mut SessionState,
        message_id: &str,
        reaction: ReactionSymbol,
    ) -> ClientEvent {
        let event = Reaction {
            message_id: message_id.to_string(),
            reaction,
            user: state.local.clone(),
        };
        state.store.apply_reaction(&event);
        ClientEvent::Reaction(event)
    }

    pub fn send_file(
        &self,
        state: &SessionState,
        vault: &KeyVault,
        to: ConversationRef,
        name: &str,
        data: &[u8],
    ) -> Result<(ClientEvent, MessageId), SessionError> {
        let to = outbound_conversation(state, to)?;
        let sealed = seal_for(state, vault, &to, data)?;
        let id = new_id();
        let (direct, group) = split(&to);
        let event = ClientEvent::File(FileTransfer {
            id: id.clone(),
            sender: state.local.clone(),
            to: direct,
            group,
            name: name.to_string(),
            data: sealed,
            sender_public_key: PublicKeyBytes(vault.public_key().to_vec()),
        });
        check_line_size(&event)?;
        Ok((event, id))
    }

    pub fn send_signal(&self, to: UserId, signal: SignalDescriptor) -> ClientEvent {
        ClientEvent::Call { to, signal }
    }

    pub fn create_group(
        &self,
        state: &mut SessionState,
        name: &str,
    ) -> Result<(ClientEvent, GroupName), SessionError> {
        let name = state.groups.create(name)?;
        Ok((ClientEvent::CreateGroup { name: name.clone() }, name))
    }

    pub fn join_group(
        &self,
        state: &mut SessionState,
        name: &str,
    ) -> Result<(ClientEvent, GroupName), SessionError> {
        let name = state.groups.join(name)?;
        Ok((ClientEvent::JoinGroup { name: name.clone() }, name))
    }
}

fn new_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

fn split(to: &ConversationRef) -> (Option<UserId>, Option<GroupName>) {
    match to {
        ConversationRef::Direct(peer) => (Some(peer.clone()), None),
        ConversationRef::Group(name) => (None, Some(name.clone())),
    }
}

fn outbound_conversation(
    state: &SessionState,
    to: ConversationRef,
) -> Result<ConversationRef, SessionError> {
    Ok(match to {
        ConversationRef::Group(name) => ConversationRef::Group(state.groups.normalize(&name)?),
        direct => direct,
    })
}

/// One sealed copy per recipient: the peer for a direct conversation,
/// every known user but us for a group.
fn seal_for(
    state: &SessionState,
    vault: &KeyVault,
    to: &ConversationRef,
    plaintext: &[u8],
) -> Result<Envelope, SessionError> {
    let mut envelope = Envelope::new();
    match to {
        ConversationRef::Direct(peer) => {
            let key = state
                .peers
                .key_of(peer)
                .ok_or_else(|| StateError::UnknownPeer(peer.clone()))?;
            envelope.insert(peer.clone(), SealedBytes(vault.seal(plaintext, key)?));
        }
        ConversationRef::Group(_) => {
            for (user, key) in state.peers.others(&state.local) {
                envelope.insert(user.clone(), SealedBytes(vault.seal(plaintext, key)?));
            }
        }
    }
    Ok(envelope)
}

fn own_entry(
    mut envelope: Envelope,
    local: &str,
    field: &'static str,
) -> Result<Vec<u8>, ProtocolError> {
    envelope
        .remove(local)
        .map(|sealed| sealed.0)
        .ok_or_else(|| ProtocolError::InvalidField {
            field,
            reason: format!("no sealed copy for {local}"),
        })
}

fn inbound_conversation(
    state: &SessionState,
    sender: &str,
    group: Option<&str>,
) -> ConversationRef {
    match group {
        Some(name) => ConversationRef::Group(
            state
                .groups
                .normalize(name)
                .unwrap_or_else(|_| name.to_string()),
        ),
        None => ConversationRef::Direct(sender.to_string()),
    }
}

/// Traffic in a group we have not heard of makes the group known.
fn record_conversation(
    state: &mut SessionState,
    conversation: &ConversationRef,
    routed: &mut Routed,
) {
    if let ConversationRef::Group(name) = conversation {
        record_group(state, name, routed);
    }
}

/// Refuse events the relay would drop as over-long.
fn check_line_size(event: &ClientEvent) -> Result<(), ProtocolError> {
    let len = encode_client_event(event)?.len();
    if len > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLong(len));
    }
    Ok(())
}

fn record_group(state: &mut SessionState, name: &str, routed: &mut Routed) {
    if state.groups.record_created(name) {
        if let Ok(name) = state.groups.normalize(name) {
            routed.events.push(SessionEvent::GroupCreated(name));
        }
    }
}

fn learn_key(state: &mut SessionState, user: &str, key: PublicKey, routed: &mut Routed) {
    if let KeyUpdate::Changed { previous } = state.peers.learn(user, key) {
        routed.events.push(SessionEvent::PeerKeyChanged {
            user: user.to_string(),
            previous,
            current: key,
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::call::CallState;
    use crate::config::SessionConfig;

    struct Side {
        state: SessionState,
        vault: KeyVault,
    }

    fn side(name: &str) -> Side {
        Side {
            state: SessionState::new(name.into(), &SessionConfig::default()),
            vault: KeyVault::generate().unwrap(),
        }
    }

    fn router() -> EventRouter {
        EventRouter::new(MediaKind::Audio)
    }

    /// Tell every side about every other side's key.
    fn introduce(sides: &mut [&mut Side]) {
        let keys: Vec<(UserId, PublicKey)> = sides
            .iter()
            .map(|s| (s.state.local.clone(), s.vault.public_key()))
            .collect();
        for s in sides.iter_mut() {
            for (user, key) in &keys {
                if *user != s.state.local {
                    s.state.peers.learn(user, *key);
                }
            }
        }
    }

    /// What the relay turns a client event into.
    fn relayed(event: ClientEvent, from: &str) -> RelayEvent {
        match event {
            ClientEvent::Message(msg) => RelayEvent::Message(msg),
            ClientEvent::Reaction(r) => RelayEvent::Reaction(r),
            ClientEvent::File(f) => RelayEvent::File(f),
            ClientEvent::Call { signal, .. } => RelayEvent::Call {
                from: from.into(),
                signal,
            },
            ClientEvent::CreateGroup { name } => RelayEvent::GroupCreated { name },
            other => panic!("not relayed in tests: {}", other.kind()),
        }
    }

    fn deliver(to: &mut Side, event: RelayEvent) -> Result<Routed, SessionError> {
        router().dispatch(event, &mut to.state, &to.vault, Instant::now())
    }

    #[test]
    fn direct_message_roundtrip() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);

        let (event, id) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "hi",
                None,
                1_000,
            )
            .unwrap();
        match &event {
            ClientEvent::Message(msg) => {
                assert_eq!(msg.to.as_deref(), Some("bob"));
                assert_eq!(msg.content.len(), 1);
                assert_eq!(msg.expiration_time, 0);
            }
            other => panic!("unexpected {}", other.kind()),
        }

        let routed = deliver(&mut bob, relayed(event, "alice")).unwrap();
        assert!(matches!(
            routed.events.as_slice(),
            [SessionEvent::MessageReceived { id: got, .. }] if *got == id
        ));
        let conv = ConversationRef::Direct("alice".into());
        let visible = bob.state.store.visible_messages(&conv, 2_000);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].text(), Some("hi"));
        assert!(visible[0].expires_at.is_none());

        // Sender keeps its own plaintext copy
        let mine = alice
            .state
            .store
            .visible_messages(&ConversationRef::Direct("bob".into()), 2_000);
        assert_eq!(mine[0].id, id);
    }

    #[test]
    fn group_message_seals_one_copy_per_peer() {
        let (mut alice, mut bob, mut carol) = (side("alice"), side("bob"), side("carol"));
        introduce(&mut [&mut alice, &mut bob, &mut carol]);

        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Group(" team ".into()),
                "standup",
                None,
                1,
            )
            .unwrap();
        let ClientEvent::Message(msg) = &event else {
            panic!("expected message");
        };
        assert_eq!(msg.group.as_deref(), Some("team"));
        assert_eq!(msg.content.keys().collect::<Vec<_>>(), ["bob", "carol"]);

        for peer in [&mut bob, &mut carol] {
            let routed = deliver(peer, relayed(event.clone(), "alice")).unwrap();
            // First message in an unknown group makes the group known
            assert!(routed
                .events
                .iter()
                .any(|e| matches!(e, SessionEvent::GroupCreated(n) if n == "team")));
            let team = ConversationRef::Group("team".into());
            assert_eq!(peer.state.store.visible_messages(&team, 1)[0].text(), Some("standup"));
            assert!(peer.state.groups.is_known("team"));
        }
    }

    #[test]
    fn unknown_peer_cannot_be_messaged() {
        let mut alice = side("alice");
        let err = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("nobody".into()),
                "hello?",
                None,
                1,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::State(StateError::UnknownPeer(_))));
        assert!(alice.state.store.is_empty());
    }

    #[test]
    fn tampered_message_reported_and_dropped() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "secret",
                None,
                1,
            )
            .unwrap();
        let ClientEvent::Message(mut msg) = event else {
            panic!("expected message");
        };
        if let Some(sealed) = msg.content.get_mut("bob") {
            let last = sealed.0.len() - 1;
            sealed.0[last] ^= 0x80;
        }

        let routed = deliver(&mut bob, RelayEvent::Message(msg)).unwrap();
        assert!(matches!(
            routed.events.as_slice(),
            [SessionEvent::DecryptionFailed { from, .. }] if from == "alice"
        ));
        assert!(bob.state.store.is_empty());
    }

    #[test]
    fn message_without_our_copy_is_a_protocol_error() {
        let (mut alice, mut bob, mut carol) = (side("alice"), side("bob"), side("carol"));
        introduce(&mut [&mut alice, &mut bob, &mut carol]);
        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "for bob",
                None,
                1,
            )
            .unwrap();

        let err = deliver(&mut carol, relayed(event, "alice")).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::InvalidField { field: "content", .. })
        ));
    }

    #[test]
    fn rejected_group_message_leaves_state_alone() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Group("ops".into()),
                "deploy",
                None,
                1,
            )
            .unwrap();
        let ClientEvent::Message(mut msg) = event else {
            panic!("expected message");
        };
        msg.content.clear();

        assert!(deliver(&mut bob, RelayEvent::Message(msg)).is_err());
        assert!(!bob.state.groups.is_known("ops"));

        // The real announcement still reaches the UI
        let routed = deliver(&mut bob, RelayEvent::GroupCreated { name: "ops".into() }).unwrap();
        assert!(matches!(routed.events.as_slice(), [SessionEvent::GroupCreated(n)] if n == "ops"));
    }

    #[test]
    fn undecryptable_message_does_not_replace_sender_key() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "hi",
                None,
                1,
            )
            .unwrap();
        let ClientEvent::Message(mut msg) = event else {
            panic!("expected message");
        };
        let forged = KeyVault::generate().unwrap().public_key();
        msg.sender_public_key = PublicKeyBytes(forged.to_vec());

        let routed = deliver(&mut bob, RelayEvent::Message(msg)).unwrap();
        assert!(matches!(
            routed.events.as_slice(),
            [SessionEvent::DecryptionFailed { .. }]
        ));
        assert_eq!(bob.state.peers.key_of("alice"), Some(&alice.vault.public_key()));
    }

    #[test]
    fn file_over_line_limit_is_refused() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let to = ConversationRef::Direct("bob".into());

        // base64 of the sealed bytes lands just under and just over 8 MiB
        let fits = vec![7u8; 6_200_000];
        assert!(router()
            .send_file(&alice.state, &alice.vault, to.clone(), "fits.bin", &fits)
            .is_ok());

        let too_big = vec![7u8; 6_300_000];
        let err = router()
            .send_file(&alice.state, &alice.vault, to, "big.bin", &too_big)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::LineTooLong(len)) if len > MAX_LINE_SIZE
        ));
    }

    #[test]
    fn message_over_line_limit_is_not_stored() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let text = "x".repeat(6_300_000);
        let err = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                &text,
                None,
                1,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::LineTooLong(_))));
        assert!(alice.state.store.is_empty());
    }

    #[test]
    fn expired_on_arrival_is_stored_but_hidden() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, id) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "gone soon",
                Some(5_000),
                4_000,
            )
            .unwrap();

        deliver(&mut bob, relayed(event, "alice")).unwrap();
        let conv = ConversationRef::Direct("alice".into());
        assert!(bob.state.store.get(&id).is_some());
        assert!(bob.state.store.visible_messages(&conv, 6_000).is_empty());
    }

    #[test]
    fn own_echo_is_ignored() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, _) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "hi",
                None,
                1,
            )
            .unwrap();
        let routed = deliver(&mut alice, relayed(event, "alice")).unwrap();
        assert!(routed.events.is_empty());
        assert_eq!(alice.state.store.len(), 1);
    }

    #[test]
    fn reaction_reaches_the_other_side() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let (event, id) = router()
            .send_message(
                &mut alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "hi",
                None,
                1,
            )
            .unwrap();
        deliver(&mut bob, relayed(event, "alice")).unwrap();

        let reaction = router().send_reaction(&mut bob.state, &id, ReactionSymbol::Heart);
        assert_eq!(bob.state.store.get(&id).unwrap().reactors(ReactionSymbol::Heart).count(), 1);

        let routed = deliver(&mut alice, relayed(reaction.clone(), "bob")).unwrap();
        assert_eq!(routed.events.len(), 1);
        // Redelivery does not change the set or notify again
        let routed = deliver(&mut alice, relayed(reaction, "bob")).unwrap();
        assert!(routed.events.is_empty());
        let reactors: Vec<_> = alice
            .state
            .store
            .get(&id)
            .unwrap()
            .reactors(ReactionSymbol::Heart)
            .cloned()
            .collect();
        assert_eq!(reactors, ["bob"]);
    }

    #[test]
    fn file_transfer_roundtrip() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        introduce(&mut [&mut alice, &mut bob]);
        let data = vec![0u8, 1, 2, 255];
        let (event, _) = router()
            .send_file(
                &alice.state,
                &alice.vault,
                ConversationRef::Direct("bob".into()),
                "blob.bin",
                &data,
            )
            .unwrap();

        let routed = deliver(&mut bob, relayed(event, "alice")).unwrap();
        match routed.events.as_slice() {
            [SessionEvent::FileReceived { name, data: got, sender, .. }] => {
                assert_eq!(name, "blob.bin");
                assert_eq!(sender, "alice");
                assert_eq!(got, &data);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn peer_key_change_is_reported() {
        let mut bob = side("bob");
        let k1 = KeyVault::generate().unwrap().public_key();
        let k2 = KeyVault::generate().unwrap().public_key();
        let announce = |key: PublicKey| RelayEvent::PeerKey {
            user: "alice".into(),
            public_key: PublicKeyBytes(key.to_vec()),
        };

        assert!(deliver(&mut bob, announce(k1)).unwrap().events.is_empty());
        let routed = deliver(&mut bob, announce(k2)).unwrap();
        assert!(matches!(
            routed.events.as_slice(),
            [SessionEvent::PeerKeyChanged { previous, current, .. }] if *previous == k1 && *current == k2
        ));
        assert_eq!(bob.state.peers.key_of("alice"), Some(&k2));
    }

    #[test]
    fn malformed_peer_key_rejected() {
        let mut bob = side("bob");
        let err = deliver(
            &mut bob,
            RelayEvent::PeerKey {
                user: "alice".into(),
                public_key: PublicKeyBytes(vec![1, 2, 3]),
            },
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Crypto(_)));
        assert!(bob.state.peers.is_empty());
    }

    #[test]
    fn group_created_and_join() {
        let (mut alice, mut bob) = (side("alice"), side("bob"));
        let (event, name) = router().create_group(&mut alice.state, "  ops ").unwrap();
        assert_eq!(name, "ops");
        assert!(router().create_group(&mut alice.state, "ops").is_err());

        let routed = deliver(&mut bob, relayed(event, "alice")).unwrap();
        assert!(matches!(routed.events.as_slice(), [SessionEvent::GroupCreated(n)] if n == "ops"));

        let (join, _) = router().join_group(&mut bob.state, "ops").unwrap();
        assert!(matches!(join, ClientEvent::JoinGroup { ref name } if name == "ops"));
        assert_eq!(bob.state.groups.current().map(String::as_str), Some("ops"));
    }

    #[test]
    fn call_offer_requests_media() {
        let mut bob = side("bob");
        let offer = router().send_signal("bob".into(), SignalDescriptor(json!({"sdp": "x"})));
        let routed = deliver(&mut bob, relayed(offer, "alice")).unwrap();
        assert!(matches!(routed.actions.as_slice(), [CallAction::Acquire(_)]));
        assert_eq!(bob.state.calls.state(), CallState::IncomingOffered);

        // A different caller is turned away
        let second = router().send_signal("bob".into(), SignalDescriptor(json!({"sdp": "y"})));
        assert!(deliver(&mut bob, relayed(second, "carol")).is_err());
        assert_eq!(bob.state.calls.peer().map(String::as_str), Some("alice"));
    }

    #[test]
    fn hello_carries_public_key() {
        let alice = side("alice");
        match router().hello(&alice.state, &alice.vault) {
            ClientEvent::Hello { user, public_key, protocol_version } => {
                assert_eq!(user, "alice");
                assert_eq!(public_key.0, alice.vault.public_key().to_vec());
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
}
