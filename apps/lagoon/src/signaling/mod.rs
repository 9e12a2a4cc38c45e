use thiserror::Error;

pub mod local;
pub mod protocol;
pub mod websocket;

pub use protocol::{CallAction, ClientEvent, ConnectionQuality, RelayEvent};

/// Outbound half of the relay. Emission is fire-and-forget: nothing is
/// acknowledged and nothing is retried.
pub trait Relay: Send + Sync {
    fn emit(&self, event: ClientEvent) -> Result<(), RelayError>;
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("failed to encode relay event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay setup failed: {0}")]
    Setup(String),
}

/// A relay message that cannot be acted upon. The offending message is
/// dropped; the session carries on.
#[derive(Debug, Error)]
pub enum SignalingProtocolError {
    #[error("malformed relay event: {0}")]
    Malformed(String),
    #[error("unhandled relay event `{0}`")]
    UnknownEvent(String),
    #[error("session description rejected: {0}")]
    InvalidDescription(String),
    #[error("ice candidate rejected: {0}")]
    InvalidCandidate(String),
}
