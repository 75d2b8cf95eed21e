//! Parley session core.
//!
//! One [`Session`] per signed-in user: it owns the key pair, the message
//! log, the group and peer directories and the call state machine, and
//! talks to a relay through channel events.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod groups;
pub mod media;
pub mod peers;
pub mod router;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use call::{CallState, SignalingCoordinator};
pub use config::{Identity, SessionConfig};
pub use error::{ResourceError, SessionError, StateError};
pub use events::SessionEvent;
pub use media::{LoopbackMedia, MediaEngine, MediaError, MediaHandle};
pub use router::EventRouter;
pub use session::Session;
pub use store::{ConversationRef, Message, MessageBody, MessageStore};
