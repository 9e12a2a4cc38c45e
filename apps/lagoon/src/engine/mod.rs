//! Boundary to the media-transport engine (ICE/DTLS/SRTP).
//!
//! The session layer drives a [`PeerConnection`] through offer/answer and
//! listens to [`PeerEvent`]s; it never reaches into the engine itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};

pub mod mock;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one peer-connection object for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, PeerConnectionState::Connected)
    }

    pub fn is_lost(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    ConnectionState(PeerConnectionState),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub connection: ConnectionId,
    pub kind: PeerEventKind,
}

/// Where an engine reports events for one connection. Every event is
/// stamped with the connection id so late events from a replaced connection
/// can be told apart.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { connection, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            connection: self.connection,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(
                target = "lagoon::engine",
                connection = self.connection.get(),
                "peer event receiver dropped"
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), EngineError>;
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());

        let parsed: IceCandidate =
            serde_json::from_str(r#"{"candidate":"candidate:2 1 UDP 1 1.2.3.4 9 typ host"}"#)
                .unwrap();
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn description_type_is_lowercase() {
        let value = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(value["type"], "answer");
    }

    #[test]
    fn only_connected_counts_as_live() {
        assert!(PeerConnectionState::Connected.is_live());
        assert!(!PeerConnectionState::Connecting.is_live());
        assert!(PeerConnectionState::Failed.is_lost());
        assert!(!PeerConnectionState::Closed.is_lost());
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }
}
