//! Call signaling state machine.
//!
//! At most one call exists at a time. The coordinator never talks to the
//! relay or the media engine itself: every method returns the
//! [`CallAction`]s the session has to carry out, in order.
//!
//! ```text
//! caller:  Idle -> Acquiring -> Outgoing -> Connected -> Idle
//! callee:  Idle -> IncomingOffered -> Connected -> Idle
//! ```
//!
//! Any state returns to `Idle` on `end_call`, on peer failure, and (for the
//! pending states) when the signaling timeout runs out.

use std::time::{Duration, Instant};

use parley_protocol::types::{MediaKind, SignalDescriptor, UserId};
use tracing::{debug, info};

use crate::error::{ResourceError, SessionError, StateError};
use crate::media::MediaHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Local media is being acquired for an outgoing call.
    Acquiring,
    /// Offer sent, waiting for the answer.
    Outgoing,
    /// Offer received, local media being acquired for the answer.
    IncomingOffered,
    Connected,
}

impl CallState {
    /// States bounded by the signaling timeout.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            CallState::Acquiring | CallState::Outgoing | CallState::IncomingOffered
        )
    }
}

/// Which descriptor to build once local media is available.
#[derive(Debug, Clone)]
pub enum Negotiation {
    Offer,
    Answer(SignalDescriptor),
}

/// Work the session runs off the actor: acquire media, then negotiate.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub attempt: u64,
    pub kind: MediaKind,
    pub negotiation: Negotiation,
}

/// A successful [`MediaRequest`]: the local stream and the descriptor built for it.
#[derive(Debug)]
pub struct LocalMedia {
    pub handle: MediaHandle,
    pub signal: SignalDescriptor,
}

#[derive(Debug)]
pub enum CallAction {
    Acquire(MediaRequest),
    SendSignal { to: UserId, signal: SignalDescriptor },
    AcceptAnswer(SignalDescriptor),
    AddRemoteSignal(SignalDescriptor),
    AttachRemote(UserId),
    /// Tear down the peer connection and release the local stream, if any.
    Close(Option<MediaHandle>),
}

#[derive(Debug)]
pub struct CallSession {
    pub peer: UserId,
    pub kind: MediaKind,
    pub state: CallState,
    pub local_signal: Option<SignalDescriptor>,
    pub remote_signal: Option<SignalDescriptor>,
    pub media_attached: bool,
    handle: Option<MediaHandle>,
    attempt: u64,
    since: Instant,
}

impl CallSession {
    fn new(peer: UserId, kind: MediaKind, state: CallState, attempt: u64, now: Instant) -> Self {
        Self {
            peer,
            kind,
            state,
            local_signal: None,
            remote_signal: None,
            media_attached: false,
            handle: None,
            attempt,
            since: now,
        }
    }

    fn attach(&mut self, actions: &mut Vec<CallAction>) {
        if !self.media_attached {
            self.media_attached = true;
            actions.push(CallAction::AttachRemote(self.peer.clone()));
        }
    }
}

#[derive(Debug)]
pub struct SignalingCoordinator {
    call: Option<CallSession>,
    attempts: u64,
    timeout: Duration,
}

impl SignalingCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            call: None,
            attempts: 0,
            timeout,
        }
    }

    pub fn state(&self) -> CallState {
        self.call.as_ref().map_or(CallState::Idle, |c| c.state)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.call.as_ref().map(|c| &c.peer)
    }

    fn busy(&self) -> Result<(), StateError> {
        match &self.call {
            Some(call) => Err(StateError::ConcurrentCall {
                active: call.peer.clone(),
            }),
            None => Ok(()),
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempts += 1;
        self.attempts
    }

    /// Begin calling `peer`. Media acquisition is requested; the call moves
    /// to `Outgoing` when [`Self::media_ready`] delivers the offer.
    pub fn start_call(
        &mut self,
        peer: &str,
        kind: MediaKind,
        now: Instant,
    ) -> Result<Vec<CallAction>, SessionError> {
        self.busy()?;
        let attempt = self.next_attempt();
        self.call = Some(CallSession::new(
            peer.to_string(),
            kind,
            CallState::Acquiring,
            attempt,
            now,
        ));
        info!(peer, ?kind, "starting call");
        Ok(vec![CallAction::Acquire(MediaRequest {
            attempt,
            kind,
            negotiation: Negotiation::Offer,
        })])
    }

    /// An offer from `from`. Only valid while idle; a second call is
    /// rejected and the current one is left as it was.
    pub fn on_remote_offer(
        &mut self,
        from: &str,
        offer: SignalDescriptor,
        kind: MediaKind,
        now: Instant,
    ) -> Result<Vec<CallAction>, SessionError> {
        self.busy()?;
        let attempt = self.next_attempt();
        let mut call = CallSession::new(
            from.to_string(),
            kind,
            CallState::IncomingOffered,
            attempt,
            now,
        );
        call.remote_signal = Some(offer.clone());
        self.call = Some(call);
        info!(peer = from, "incoming call");
        Ok(vec![CallAction::Acquire(MediaRequest {
            attempt,
            kind,
            negotiation: Negotiation::Answer(offer),
        })])
    }

    /// The answer to our offer.
    pub fn on_remote_answer(
        &mut self,
        from: &str,
        answer: SignalDescriptor,
    ) -> Result<Vec<CallAction>, SessionError> {
        let call = match self.call.as_mut() {
            Some(call) if call.state == CallState::Outgoing && call.peer == from => call,
            _ => {
                return Err(StateError::UnexpectedAnswer {
                    from: from.to_string(),
                }
                .into())
            }
        };
        call.state = CallState::Connected;
        call.remote_signal = Some(answer.clone());

        let mut actions = vec![CallAction::AcceptAnswer(answer)];
        call.attach(&mut actions);
        info!(peer = from, "call connected");
        Ok(actions)
    }

    /// Any `call` event. Whether it is an offer, an answer or extra
    /// negotiation data follows from the current state.
    pub fn on_remote_signal(
        &mut self,
        from: &str,
        signal: SignalDescriptor,
        answer_kind: MediaKind,
        now: Instant,
    ) -> Result<Vec<CallAction>, SessionError> {
        let Some(call) = self.call.as_ref() else {
            return self.on_remote_offer(from, signal, answer_kind, now);
        };
        if call.peer != from {
            return Err(StateError::ConcurrentCall {
                active: call.peer.clone(),
            }
            .into());
        }
        match call.state {
            CallState::Outgoing => self.on_remote_answer(from, signal),
            CallState::IncomingOffered | CallState::Connected => {
                debug!(peer = from, "extra signal forwarded");
                Ok(vec![CallAction::AddRemoteSignal(signal)])
            }
            // Both sides dialled each other; ours is still acquiring.
            CallState::Acquiring | CallState::Idle => Err(StateError::ConcurrentCall {
                active: call.peer.clone(),
            }
            .into()),
        }
    }

    /// Result of a [`MediaRequest`].
    ///
    /// A result for an attempt that is no longer current (the call was
    /// ended or replaced meanwhile) releases the media it brought.
    pub fn media_ready(
        &mut self,
        attempt: u64,
        result: Result<LocalMedia, ResourceError>,
        now: Instant,
    ) -> Result<Vec<CallAction>, SessionError> {
        let current = self.call.as_ref().is_some_and(|c| {
            c.attempt == attempt
                && c.handle.is_none()
                && matches!(c.state, CallState::Acquiring | CallState::IncomingOffered)
        });
        if !current {
            debug!(attempt, "stale media result");
            return Ok(match result {
                Ok(media) => vec![CallAction::Close(Some(media.handle))],
                Err(_) => Vec::new(),
            });
        }

        let media = match result {
            Ok(media) => media,
            Err(e) => {
                self.call = None;
                return Err(e.into());
            }
        };
        let Some(call) = self.call.as_mut() else {
            return Ok(vec![CallAction::Close(Some(media.handle))]);
        };

        call.handle = Some(media.handle);
        call.local_signal = Some(media.signal.clone());
        let mut actions = vec![CallAction::SendSignal {
            to: call.peer.clone(),
            signal: media.signal,
        }];

        if call.state == CallState::Acquiring {
            call.state = CallState::Outgoing;
            call.since = now;
            info!(peer = %call.peer, "offer sent");
        } else {
            call.state = CallState::Connected;
            call.attach(&mut actions);
            info!(peer = %call.peer, "call answered");
        }
        Ok(actions)
    }

    /// Hang up. Does nothing when idle.
    pub fn end_call(&mut self) -> Vec<CallAction> {
        match self.call.take() {
            Some(call) => {
                info!(peer = %call.peer, state = ?call.state, "call ended");
                vec![CallAction::Close(call.handle)]
            }
            None => Vec::new(),
        }
    }

    /// The media engine lost the connection to `peer`.
    pub fn on_peer_failure(&mut self, peer: &str) -> Vec<CallAction> {
        if self.peer().is_some_and(|p| p == peer) {
            self.end_call()
        } else {
            Vec::new()
        }
    }

    /// Drop a call that has been pending for at least the signaling timeout.
    /// Returns the peer and the teardown actions.
    pub fn expire(&mut self, now: Instant) -> Option<(UserId, Vec<CallAction>)> {
        let call = self.call.as_ref()?;
        if !call.state.is_pending() || now.saturating_duration_since(call.since) < self.timeout {
            return None;
        }
        let peer = call.peer.clone();
        info!(%peer, state = ?call.state, "call signaling timed out");
        Some((peer, self.end_call()))
    }
}
