//! Media engine collaborator.
//!
//! Device capture and the peer connection live outside this crate. The
//! session drives them through [`MediaEngine`]; [`LoopbackMedia`] is an
//! in-process engine for headless runs and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_protocol::types::{MediaKind, SignalDescriptor, UserId};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// A local capture stream owned by the session while a call needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: u64,
    pub kind: MediaKind,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open the microphone (and camera for [`MediaKind::AudioVideo`]).
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaHandle, MediaError>;

    /// Build the initiator descriptor for a call carrying `local`.
    async fn create_offer(&self, local: &MediaHandle) -> Result<SignalDescriptor, MediaError>;

    /// Build the answer to a remote offer.
    async fn create_answer(
        &self,
        offer: &SignalDescriptor,
        local: &MediaHandle,
    ) -> Result<SignalDescriptor, MediaError>;

    async fn accept_answer(&self, answer: &SignalDescriptor) -> Result<(), MediaError>;

    /// Extra negotiation data (ICE candidates) from the active peer.
    async fn add_remote_signal(&self, signal: &SignalDescriptor) -> Result<(), MediaError>;

    /// Start rendering the peer's stream.
    async fn attach_remote(&self, peer: &UserId) -> Result<(), MediaError>;

    /// Tear down the peer connection and release `local` if given.
    async fn close(&self, local: Option<MediaHandle>);
}

/// Media engine that negotiates with itself.
///
/// Descriptors are small JSON objects; counters record what the session
/// asked for so callers can check that devices are never leaked.
#[derive(Debug, Default)]
pub struct LoopbackMedia {
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    remote_attached: AtomicU64,
    remote_signals: AtomicU64,
    deny: AtomicBool,
    acquire_delay_ms: AtomicU64,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent acquisition fail with `PermissionDenied`.
    pub fn deny_access(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Hold every subsequent acquisition for `delay`, like a slow permission prompt.
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.acquire_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles acquired and not yet released.
    pub fn live_handles(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }

    pub fn remote_attached(&self) -> u64 {
        self.remote_attached.load(Ordering::SeqCst)
    }

    pub fn remote_signals(&self) -> u64 {
        self.remote_signals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for LoopbackMedia {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            let device = if kind.has_video() { "camera" } else { "microphone" };
            return Err(MediaError::PermissionDenied(device.into()));
        }
        let delay = self.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(id, ?kind, "loopback media acquired");
        Ok(MediaHandle { id, kind })
    }

    async fn create_offer(&self, local: &MediaHandle) -> Result<SignalDescriptor, MediaError> {
        Ok(SignalDescriptor(json!({
            "type": "offer",
            "sdp": format!("loopback-{}", local.id),
            "video": local.kind.has_video(),
        })))
    }

    async fn create_answer(
        &self,
        offer: &SignalDescriptor,
        local: &MediaHandle,
    ) -> Result<SignalDescriptor, MediaError> {
        if offer.0.get("sdp").is_none() {
            return Err(MediaError::Negotiation("offer has no session description".into()));
        }
        Ok(SignalDescriptor(json!({
            "type": "answer",
            "sdp": format!("loopback-{}", local.id),
        })))
    }

    async fn accept_answer(&self, answer: &SignalDescriptor) -> Result<(), MediaError> {
        if answer.0.get("sdp").is_none() {
            return Err(MediaError::Negotiation("answer has no session description".into()));
        }
        Ok(())
    }

    async fn add_remote_signal(&self, _signal: &SignalDescriptor) -> Result<(), MediaError> {
        self.remote_signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_remote(&self, peer: &UserId) -> Result<(), MediaError> {
        self.remote_attached.fetch_add(1, Ordering::SeqCst);
        debug!(%peer, "loopback remote stream attached");
        Ok(())
    }

    async fn close(&self, local: Option<MediaHandle>) {
        if let Some(handle) = local {
            self.released.fetch_add(1, Ordering::SeqCst);
            debug!(id = handle.id, "loopback media released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_are_counted() {
        let media = LoopbackMedia::new();
        let a = media.acquire_local_media(MediaKind::Audio).await.unwrap();
        let b = media.acquire_local_media(MediaKind::AudioVideo).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(media.live_handles(), 2);

        media.close(Some(a)).await;
        media.close(None).await;
        assert_eq!(media.live_handles(), 1);
    }

    #[tokio::test]
    async fn denied_access_acquires_nothing() {
        let media = LoopbackMedia::new();
        media.deny_access(true);
        let err = media.acquire_local_media(MediaKind::AudioVideo).await.unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(ref d) if d == "camera"));
        assert_eq!(media.acquired(), 0);
    }

    #[tokio::test]
    async fn offer_answer_exchange() {
        let media = LoopbackMedia::new();
        let local = media.acquire_local_media(MediaKind::Audio).await.unwrap();
        let offer = media.create_offer(&local).await.unwrap();
        assert_eq!(offer.0["type"], "offer");
        let answer = media.create_answer(&offer, &local).await.unwrap();
        media.accept_answer(&answer).await.unwrap();

        let bogus = SignalDescriptor(json!({"candidate": "x"}));
        assert!(media.create_answer(&bogus, &local).await.is_err());
    }
}
