//! The call session: one negotiator driving one peer connection, one state
//! machine deciding what the session looks like, and a dispatcher feeding
//! both from the relay, the engine and the user.

use thiserror::Error;

use crate::engine::{EngineError, IceServer};
use crate::media::{CallKind, MediaAcquisitionError};
use crate::room::Participant;
use crate::signaling::{ConnectionQuality, RelayError, SignalingProtocolError};

pub mod dispatcher;
pub mod negotiator;
pub mod state;

pub use dispatcher::{CallController, CallHandle, Command};
pub use negotiator::{Continuation, Negotiator, Role};
pub use state::{CallStateMachine, Effect, HangupOrigin, SessionInput, SessionState, Transition};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub local_user_id: String,
    pub ice_servers: Vec<IceServer>,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, local_user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            local_user_id: local_user_id.into(),
            ice_servers: Vec::new(),
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}

/// Everything the presentation layer is allowed to know about the call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSnapshot {
    pub state: SessionState,
    pub call_kind: Option<CallKind>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub quality: ConnectionQuality,
    pub remote: Option<Participant>,
    pub has_remote_media: bool,
    pub remote_muted: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Signaling(#[from] SignalingProtocolError),
    #[error("negotiation superseded by teardown")]
    Superseded,
    #[error("call controller stopped")]
    ControllerStopped,
}

impl CallError {
    pub fn user_message(&self) -> String {
        match self {
            CallError::Media(err) => err.user_message(),
            other => format!("Failed to start call. {other}"),
        }
    }
}
