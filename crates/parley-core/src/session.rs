//! The session actor.
//!
//! A [`Session`] is a cheap handle. All mutations go through one mailbox
//! drained by a single task that owns the [`KeyVault`]; reads take a read
//! guard on the shared [`SessionState`]. Media acquisition runs in its own
//! task and posts its result back to the mailbox.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_crypto::{CryptoError, KeyVault, PublicKey};
use parley_protocol::messages::{ClientEvent, RelayEvent};
use parley_protocol::types::{GroupName, MediaKind, MessageId, ReactionSymbol, Timestamp, UserId};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::call::{CallAction, CallState, LocalMedia, MediaRequest, Negotiation};
use crate::config::{Identity, SessionConfig};
use crate::error::{ResourceError, SessionError, StateError};
use crate::events::SessionEvent;
use crate::media::MediaEngine;
use crate::router::EventRouter;
use crate::state::{now_millis, SessionState};
use crate::store::{ConversationRef, Message};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    SendMessage {
        to: ConversationRef,
        text: String,
        expires_in: Option<Duration>,
        reply: Reply<MessageId>,
    },
    SendReaction {
        message_id: MessageId,
        reaction: ReactionSymbol,
        reply: Reply<()>,
    },
    SendFile {
        to: ConversationRef,
        name: String,
        data: Vec<u8>,
        reply: Reply<MessageId>,
    },
    StartCall {
        peer: UserId,
        kind: MediaKind,
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    CreateGroup {
        name: String,
        reply: Reply<GroupName>,
    },
    JoinGroup {
        name: String,
        reply: Reply<GroupName>,
    },
    Deliver(RelayEvent),
    Disconnected,
    PeerFailure(UserId),
    MediaReady {
        attempt: u64,
        result: Result<LocalMedia, ResourceError>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    local: UserId,
    public_key: PublicKey,
    tx: mpsc::Sender<Command>,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Generate the session key pair, announce it on `outbound` and start
    /// the actor.
    ///
    /// Fails with [`ResourceError::Entropy`] when no key pair can be made;
    /// there is no session without one.
    pub async fn start(
        identity: Identity,
        config: &SessionConfig,
        engine: Arc<dyn MediaEngine>,
        outbound: mpsc::Sender<ClientEvent>,
    ) -> Result<Session, SessionError> {
        let vault = KeyVault::generate().map_err(|e| match e {
            CryptoError::Entropy => {
                error!(user = %identity.username, "no entropy source, session not started");
                SessionError::from(ResourceError::Entropy)
            }
            other => other.into(),
        })?;
        let public_key = vault.public_key();

        let router = EventRouter::new(config.answer_media);
        let state = SessionState::new(identity.username.clone(), config);
        outbound
            .send(router.hello(&state, &vault))
            .await
            .map_err(|_| ResourceError::ChannelClosed)?;

        let capacity = config.mailbox_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity * 4);
        let state = Arc::new(RwLock::new(state));

        let actor = Actor {
            vault,
            state: state.clone(),
            router,
            engine,
            outbound,
            events: events.clone(),
            mailbox: tx.downgrade(),
            pending_start: None,
        };
        tokio::spawn(actor.run(rx, config.sweep_interval()));

        info!(
            user = %identity.username,
            key = %public_key.fingerprint(),
            "session started"
        );
        Ok(Session {
            local: identity.username,
            public_key,
            tx,
            state,
            events,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    async fn post(&self, command: Command) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    /// Send a text message. With `expires_in`, recipients stop showing it
    /// once that much time has passed.
    pub async fn send_message(
        &self,
        to: ConversationRef,
        text: impl Into<String>,
        expires_in: Option<Duration>,
    ) -> Result<MessageId, SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage {
            to,
            text,
            expires_in,
            reply,
        })
        .await
    }

    pub async fn send_reaction(
        &self,
        message_id: impl Into<MessageId>,
        reaction: ReactionSymbol,
    ) -> Result<(), SessionError> {
        let message_id = message_id.into();
        self.request(|reply| Command::SendReaction {
            message_id,
            reaction,
            reply,
        })
        .await
    }

    pub async fn send_file(
        &self,
        to: ConversationRef,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<MessageId, SessionError> {
        let name = name.into();
        self.request(|reply| Command::SendFile {
            to,
            name,
            data,
            reply,
        })
        .await
    }

    /// Call `peer`. Resolves once local media is up and the offer is on its
    /// way; the call is then `Outgoing`.
    pub async fn start_call(
        &self,
        peer: impl Into<UserId>,
        kind: MediaKind,
    ) -> Result<(), SessionError> {
        let peer = peer.into();
        self.request(|reply| Command::StartCall { peer, kind, reply })
            .await
    }

    pub async fn end_call(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn create_group(&self, name: impl Into<String>) -> Result<GroupName, SessionError> {
        let name = name.into();
        self.request(|reply| Command::CreateGroup { name, reply })
            .await
    }

    pub async fn join_group(&self, name: impl Into<String>) -> Result<GroupName, SessionError> {
        let name = name.into();
        self.request(|reply| Command::JoinGroup { name, reply })
            .await
    }

    /// Queue an inbound relay event.
    pub async fn deliver(&self, event: RelayEvent) -> Result<(), SessionError> {
        self.post(Command::Deliver(event)).await
    }

    /// The relay connection is gone.
    pub async fn disconnected(&self) -> Result<(), SessionError> {
        self.post(Command::Disconnected).await
    }

    /// The media engine lost the peer connection to `peer`.
    pub async fn report_peer_failure(&self, peer: impl Into<UserId>) -> Result<(), SessionError> {
        self.post(Command::PeerFailure(peer.into())).await
    }

    pub async fn visible_messages(&self, conversation: &ConversationRef) -> Vec<Message> {
        self.visible_messages_at(conversation, now_millis()).await
    }

    pub async fn visible_messages_at(
        &self,
        conversation: &ConversationRef,
        now: Timestamp,
    ) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .store
            .visible_messages(conversation, now)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn known_groups(&self) -> BTreeSet<GroupName> {
        self.state.read().await.groups.known_groups().clone()
    }

    pub async fn current_group(&self) -> Option<GroupName> {
        self.state.read().await.groups.current().cloned()
    }

    pub async fn call_state(&self) -> CallState {
        self.state.read().await.calls.state()
    }

    pub async fn peer_key(&self, user: &str) -> Option<PublicKey> {
        self.state.read().await.peers.key_of(user).copied()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn user(&self) -> &str {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Hang up, release media and stop the actor. The key pair is dropped
    /// with it.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Actor {
    vault: KeyVault,
    state: Arc<RwLock<SessionState>>,
    router: EventRouter,
    engine: Arc<dyn MediaEngine>,
    outbound: mpsc::Sender<ClientEvent>,
    events: broadcast::Sender<SessionEvent>,
    mailbox: mpsc::WeakSender<Command>,
    /// Caller of `start_call` waiting for the offer to go out.
    pending_start: Option<Reply<()>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        info!(key = %self.vault.public_key().fingerprint(), "session stopped");
    }

    async fn handle(&mut self, command: Command) {
        let before = self.call_state().await;

        match command {
            Command::SendMessage {
                to,
                text,
                expires_in,
                reply,
            } => {
                let now_ms = now_millis();
                let expires_at = expires_in.map(|d| now_ms.saturating_add(d.as_millis() as u64));
                let built = {
                    let mut state = self.state.write().await;
                    self.router
                        .send_message(&mut state, &self.vault, to, &text, expires_at, now_ms)
                };
                let result = match built {
                    Ok((event, id)) => self.send(event).await.map(|_| id),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SendReaction {
                message_id,
                reaction,
                reply,
            } => {
                let event = {
                    let mut state = self.state.write().await;
                    self.router.send_reaction(&mut state, &message_id, reaction)
                };
                let _ = reply.send(self.send(event).await);
            }
            Command::SendFile {
                to,
                name,
                data,
                reply,
            } => {
                let built = {
                    let state = self.state.read().await;
                    self.router.send_file(&state, &self.vault, to, &name, &data)
                };
                let result = match built {
                    Ok((event, id)) => self.send(event).await.map(|_| id),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::StartCall { peer, kind, reply } => {
                let started = self
                    .state
                    .write()
                    .await
                    .calls
                    .start_call(&peer, kind, Instant::now());
                match started {
                    Ok(actions) => {
                        self.pending_start = Some(reply);
                        self.perform(actions).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::EndCall { reply } => {
                self.end_call(StateError::CallCancelled).await;
                let _ = reply.send(Ok(()));
            }
            Command::CreateGroup { name, reply } => {
                let built = {
                    let mut state = self.state.write().await;
                    self.router.create_group(&mut state, &name)
                };
                let result = match built {
                    Ok((event, name)) => self.send(event).await.map(|_| name),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::JoinGroup { name, reply } => {
                let built = {
                    let mut state = self.state.write().await;
                    self.router.join_group(&mut state, &name)
                };
                let result = match built {
                    Ok((event, name)) => self.send(event).await.map(|_| name),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Deliver(event) => self.deliver(event).await,
            Command::Disconnected => {
                warn!("relay disconnected");
                self.end_call(StateError::CallCancelled).await;
                self.publish(SessionEvent::Disconnected);
            }
            Command::PeerFailure(peer) => {
                let actions = self.state.write().await.calls.on_peer_failure(&peer);
                if !actions.is_empty() {
                    warn!(%peer, "peer connection failed");
                    self.fail_pending(StateError::CallCancelled.into());
                    self.publish(SessionEvent::CallFailed {
                        peer,
                        reason: "peer connection failed".into(),
                    });
                    self.perform(actions).await;
                }
            }
            Command::MediaReady { attempt, result } => self.media_ready(attempt, result).await,
            // Handled in `run`
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }

        self.notify_call_change(before).await;
    }

    async fn deliver(&mut self, event: RelayEvent) {
        let kind = event.kind();
        let routed = {
            let mut state = self.state.write().await;
            self.router
                .dispatch(event, &mut state, &self.vault, Instant::now())
        };
        match routed {
            Ok(routed) => {
                for event in routed.events {
                    self.publish(event);
                }
                self.perform(routed.actions).await;
            }
            Err(e) => {
                warn!(event = kind, "discarded inbound event: {e}");
                self.publish(SessionEvent::Rejected {
                    event: kind,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn media_ready(&mut self, attempt: u64, result: Result<LocalMedia, ResourceError>) {
        let (peer, outcome) = {
            let mut state = self.state.write().await;
            let peer = state.calls.peer().cloned();
            (peer, state.calls.media_ready(attempt, result, Instant::now()))
        };
        match outcome {
            Ok(actions) => {
                let sends_offer = actions
                    .iter()
                    .any(|a| matches!(a, CallAction::SendSignal { .. }));
                self.perform(actions).await;
                if sends_offer && self.call_state().await == CallState::Outgoing {
                    if let Some(reply) = self.pending_start.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            Err(e) => {
                let peer = peer.unwrap_or_default();
                warn!(%peer, "call setup failed: {e}");
                self.publish(SessionEvent::CallFailed {
                    peer,
                    reason: e.to_string(),
                });
                self.fail_pending(e);
            }
        }
    }

    async fn sweep(&mut self) {
        let (purged, expired) = {
            let mut state = self.state.write().await;
            (
                state.store.purge_expired(now_millis()),
                state.calls.expire(Instant::now()),
            )
        };
        if purged > 0 {
            debug!(purged, "expired messages removed");
        }
        if let Some((peer, actions)) = expired {
            let err = StateError::SignalingTimeout { peer: peer.clone() };
            let reason = err.to_string();
            self.fail_pending(err.into());
            self.publish(SessionEvent::CallFailed { peer, reason });
            self.perform(actions).await;
            self.publish(SessionEvent::CallStateChanged {
                peer: None,
                state: CallState::Idle,
            });
        }
    }

    /// End whatever call there is. A `start_call` still waiting for media
    /// fails with `cause`.
    async fn end_call(&mut self, cause: StateError) {
        let actions = self.state.write().await.calls.end_call();
        if !actions.is_empty() {
            self.fail_pending(cause.into());
        }
        self.perform(actions).await;
    }

    async fn teardown(&mut self) {
        let before = self.call_state().await;
        self.end_call(StateError::CallCancelled).await;
        self.notify_call_change(before).await;
        self.fail_pending(SessionError::Closed);
    }

    async fn perform(&mut self, actions: Vec<CallAction>) {
        for action in actions {
            let step = match action {
                CallAction::Acquire(request) => {
                    self.spawn_media(request);
                    Ok(())
                }
                CallAction::SendSignal { to, signal } => {
                    let event = self.router.send_signal(to, signal);
                    if let Err(e) = self.send(event).await {
                        warn!("failed to send call signal: {e}");
                    }
                    Ok(())
                }
                CallAction::AcceptAnswer(answer) => self.engine.accept_answer(&answer).await,
                CallAction::AddRemoteSignal(signal) => {
                    if let Err(e) = self.engine.add_remote_signal(&signal).await {
                        warn!("remote signal rejected by media engine: {e}");
                    }
                    Ok(())
                }
                CallAction::AttachRemote(peer) => self.engine.attach_remote(&peer).await,
                CallAction::Close(handle) => {
                    self.engine.close(handle).await;
                    Ok(())
                }
            };

            if let Err(e) = step {
                let err = ResourceError::Negotiation(e);
                warn!("call negotiation failed: {err}");
                let mut state = self.state.write().await;
                let peer = state.calls.peer().cloned().unwrap_or_default();
                let teardown = state.calls.end_call();
                drop(state);
                for action in teardown {
                    if let CallAction::Close(handle) = action {
                        self.engine.close(handle).await;
                    }
                }
                self.publish(SessionEvent::CallFailed {
                    peer,
                    reason: err.to_string(),
                });
                break;
            }
        }
    }

    /// Acquire media and build the descriptor off the actor.
    fn spawn_media(&self, request: MediaRequest) {
        let engine = self.engine.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let attempt = request.attempt;
            let result = negotiate(engine.as_ref(), request).await;
            let undelivered = match mailbox.upgrade() {
                Some(tx) => match tx.send(Command::MediaReady { attempt, result }).await {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(command)) => Some(command),
                },
                None => Some(Command::MediaReady { attempt, result }),
            };
            // The session is gone; nobody will release this stream.
            if let Some(Command::MediaReady {
                result: Ok(media), ..
            }) = undelivered
            {
                engine.close(Some(media.handle)).await;
            }
        });
    }

    async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        let kind = event.kind();
        self.outbound
            .send(event)
            .await
            .map_err(|_| ResourceError::ChannelClosed)?;
        debug!(event = kind, "sent");
        Ok(())
    }

    fn fail_pending(&mut self, err: SessionError) {
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn call_state(&self) -> CallState {
        self.state.read().await.calls.state()
    }

    async fn notify_call_change(&self, before: CallState) {
        let (peer, state) = {
            let state = self.state.read().await;
            (state.calls.peer().cloned(), state.calls.state())
        };
        if state != before {
            self.publish(SessionEvent::CallStateChanged { peer, state });
        }
    }
}

async fn negotiate(
    engine: &dyn MediaEngine,
    request: MediaRequest,
) -> Result<LocalMedia, ResourceError> {
    let handle = engine
        .acquire_local_media(request.kind)
        .await
        .map_err(ResourceError::MediaAcquisition)?;
    let signal = match &request.negotiation {
        Negotiation::Offer => engine.create_offer(&handle).await,
        Negotiation::Answer(offer) => engine.create_answer(offer, &handle).await,
    };
    match signal {
        Ok(signal) => Ok(LocalMedia { handle, signal }),
        Err(e) => {
            engine.close(Some(handle)).await;
            Err(ResourceError::Negotiation(e))
        }
    }
}
