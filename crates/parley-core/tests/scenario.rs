//! Two sessions talking through an in-memory relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_core::{
    CallState, ConversationRef, Identity, LoopbackMedia, Session, SessionConfig, SessionEvent,
};
use parley_protocol::messages::{ClientEvent, RelayEvent};
use parley_protocol::types::{MediaKind, PublicKeyBytes, ReactionSymbol, UserId};
use tokio::sync::{broadcast, mpsc, Mutex};

#[derive(Default)]
struct MemoryRelay {
    sessions: Mutex<HashMap<UserId, Session>>,
    keys: Mutex<HashMap<UserId, PublicKeyBytes>>,
}

impl MemoryRelay {
    async fn send_to(&self, user: &str, event: RelayEvent) {
        let target = self.sessions.lock().await.get(user).cloned();
        if let Some(session) = target {
            session.deliver(event).await.unwrap();
        }
    }

    async fn send_to_others(&self, from: &str, event: RelayEvent) {
        let targets: Vec<Session> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|(user, _)| user.as_str() != from)
            .map(|(_, s)| s.clone())
            .collect();
        for session in targets {
            session.deliver(event.clone()).await.unwrap();
        }
    }

    /// Route one client event the way the relay binary does.
    async fn route(&self, from: &str, event: ClientEvent) {
        match event {
            ClientEvent::Hello { user, public_key, .. } => {
                let known: Vec<(UserId, PublicKeyBytes)> = self
                    .keys
                    .lock()
                    .await
                    .iter()
                    .map(|(u, k)| (u.clone(), k.clone()))
                    .collect();
                for (u, k) in known {
                    self.send_to(&user, RelayEvent::PeerKey { user: u, public_key: k })
                        .await;
                }
                self.keys.lock().await.insert(user.clone(), public_key.clone());
                self.send_to_others(&user, RelayEvent::PeerKey {
                    user: user.clone(),
                    public_key,
                })
                .await;
            }
            ClientEvent::Message(msg) => match msg.to.clone() {
                Some(to) => self.send_to(&to, RelayEvent::Message(msg)).await,
                None => self.send_to_others(from, RelayEvent::Message(msg)).await,
            },
            ClientEvent::Reaction(r) => self.send_to_others(from, RelayEvent::Reaction(r)).await,
            ClientEvent::Call { to, signal } => {
                self.send_to(&to, RelayEvent::Call {
                    from: from.to_string(),
                    signal,
                })
                .await
            }
            ClientEvent::CreateGroup { name } => {
                self.send_to_others("", RelayEvent::GroupCreated { name }).await
            }
            ClientEvent::JoinGroup { .. } => {}
            ClientEvent::File(f) => match f.to.clone() {
                Some(to) => self.send_to(&to, RelayEvent::File(f)).await,
                None => self.send_to_others(from, RelayEvent::File(f)).await,
            },
        }
    }
}

struct Peer {
    session: Session,
    media: Arc<LoopbackMedia>,
    events: broadcast::Receiver<SessionEvent>,
}

async fn join(relay: &Arc<MemoryRelay>, user: &str) -> Peer {
    let media = Arc::new(LoopbackMedia::new());
    let (tx, mut rx) = mpsc::channel::<ClientEvent>(64);
    let session = Session::start(
        Identity::new(user, format!("{user}@example.com")),
        &SessionConfig::default(),
        media.clone(),
        tx,
    )
    .await
    .unwrap();
    let events = session.subscribe();
    relay
        .sessions
        .lock()
        .await
        .insert(user.to_string(), session.clone());

    let pump = relay.clone();
    let from = user.to_string();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            pump.route(&from, event).await;
        }
    });

    Peer {
        session,
        media,
        events,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_for_key(session: &Session, user: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.peer_key(user).await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer key never arrived");
}

async fn wait_for_state(session: &Session, state: CallState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.call_state().await != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("call never reached the expected state");
}

#[tokio::test]
async fn hi_then_audio_call() {
    let relay = Arc::new(MemoryRelay::default());
    let a = join(&relay, "alice").await;
    let mut b = join(&relay, "bob").await;
    wait_for_key(&a.session, "bob").await;
    wait_for_key(&b.session, "alice").await;

    // A sends "hi" to B, never expiring
    let id = a
        .session
        .send_message(ConversationRef::Direct("bob".into()), "hi", None)
        .await
        .unwrap();
    wait_for(&mut b.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;

    let from_alice = ConversationRef::Direct("alice".into());
    let visible = b.session.visible_messages(&from_alice).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, id);
    assert_eq!(visible[0].text(), Some("hi"));
    assert!(visible[0].expires_at.is_none());

    // A calls B with audio
    assert_eq!(a.session.call_state().await, CallState::Idle);
    a.session.start_call("bob", MediaKind::Audio).await.unwrap();
    let state = a.session.call_state().await;
    assert!(
        matches!(state, CallState::Outgoing | CallState::Connected),
        "unexpected state {state:?}"
    );

    // B answers automatically; A ends up connected
    wait_for_state(&b.session, CallState::Connected).await;
    wait_for_state(&a.session, CallState::Connected).await;
    assert_eq!(a.media.remote_attached(), 1);
    assert_eq!(b.media.remote_attached(), 1);

    a.session.end_call().await.unwrap();
    assert_eq!(a.session.call_state().await, CallState::Idle);
    assert_eq!(a.media.live_handles(), 0);
    // Ending locally does not hang up the other side until its engine notices
    b.session.report_peer_failure("alice").await.unwrap();
    wait_for(&mut b.events, |e| {
        matches!(e, SessionEvent::CallStateChanged { state: CallState::Idle, .. })
    })
    .await;
    assert_eq!(b.session.call_state().await, CallState::Idle);
    assert_eq!(b.media.live_handles(), 0);
}

#[tokio::test]
async fn reactions_and_groups_across_sessions() {
    let relay = Arc::new(MemoryRelay::default());
    let mut a = join(&relay, "alice").await;
    let mut b = join(&relay, "bob").await;
    wait_for_key(&a.session, "bob").await;
    wait_for_key(&b.session, "alice").await;

    a.session.create_group("  book   club ").await.unwrap();
    wait_for(&mut b.events, |e| {
        matches!(e, SessionEvent::GroupCreated(n) if n == "book club")
    })
    .await;
    assert!(b.session.known_groups().await.contains("book club"));
    b.session.join_group("book club").await.unwrap();
    assert_eq!(b.session.current_group().await.as_deref(), Some("book club"));

    let club = ConversationRef::Group("book club".into());
    let id = a
        .session
        .send_message(club.clone(), "chapter 3?", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    wait_for(&mut b.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;
    let visible = b.session.visible_messages(&club).await;
    assert_eq!(visible[0].text(), Some("chapter 3?"));
    assert!(visible[0].expires_at.is_some());

    b.session.send_reaction(id.clone(), ReactionSymbol::ThumbsUp).await.unwrap();
    b.session.send_reaction(id.clone(), ReactionSymbol::ThumbsUp).await.unwrap();
    wait_for(&mut a.events, |e| matches!(e, SessionEvent::ReactionUpdated { .. })).await;

    let mine = a.session.visible_messages(&club).await;
    let reactors: Vec<_> = mine[0].reactors(ReactionSymbol::ThumbsUp).collect();
    assert_eq!(reactors, ["bob"]);

    // Duplicate create is refused locally
    assert!(a.session.create_group("book club").await.is_err());
}

#[tokio::test]
async fn file_reaches_peer() {
    let relay = Arc::new(MemoryRelay::default());
    let a = join(&relay, "alice").await;
    let mut b = join(&relay, "bob").await;
    wait_for_key(&a.session, "bob").await;

    let payload = b"%PDF-1.7 fake".to_vec();
    a.session
        .send_file(ConversationRef::Direct("bob".into()), "notes.pdf", payload.clone())
        .await
        .unwrap();

    let event = wait_for(&mut b.events, |e| matches!(e, SessionEvent::FileReceived { .. })).await;
    let SessionEvent::FileReceived { name, data, sender, .. } = event else {
        unreachable!()
    };
    assert_eq!(name, "notes.pdf");
    assert_eq!(sender, "alice");
    assert_eq!(data, payload);
}
