use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{
    EngineError, IceCandidate, IceServer, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEventKind, PeerEventSink, SdpType, SessionDescription,
};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};

/// In-memory engine. Descriptions are plain SDP text with one `m=` line per
/// attached track; a connection "comes up" as soon as both descriptions are
/// applied, unless the engine was built with [`MockEngine::manual`].
#[derive(Default)]
pub struct MockEngine {
    manual: bool,
    gate: Option<Arc<Semaphore>>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections never report tracks or state changes on their own; tests
    /// drive them with [`MockPeerConnection::fire_state`] and friends.
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    /// Description steps (`create_*`, `set_*_description`) wait for a permit
    /// from [`MockEngine::release`] before they run.
    pub fn gated(self) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..self
        }
    }

    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockEngine {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let connection = Arc::new(MockPeerConnection {
            events,
            auto_connect: !self.manual,
            gate: self.gate.clone(),
            ice_servers: ice_servers.to_vec(),
            state: Mutex::new(MockState::default()),
        });
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Default)]
struct MockState {
    tracks: Vec<LocalTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

pub struct MockPeerConnection {
    events: PeerEventSink,
    auto_connect: bool,
    gate: Option<Arc<Semaphore>>,
    ice_servers: Vec<IceServer>,
    state: Mutex<MockState>,
}

impl MockPeerConnection {
    pub fn fire_state(&self, state: PeerConnectionState) {
        self.events.emit(PeerEventKind::ConnectionState(state));
    }

    pub fn fire_track(&self, kind: MediaKind) {
        self.events.emit(PeerEventKind::Track(RemoteTrack {
            id: format!("remote-{kind:?}-{}", self.events.connection().get()).to_lowercase(),
            kind,
            stream_id: "remote".into(),
        }));
    }

    pub fn fire_candidate(&self, candidate: &str) {
        self.events.emit(PeerEventKind::IceCandidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    pub fn added_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    fn render_sdp(&self, tracks: &[LocalTrack]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.events.connection().get()
        );
        for (mid, track) in tracks.iter().enumerate() {
            let (media, payload) = match track.kind() {
                MediaKind::Audio => ("audio", 111),
                MediaKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{mid}\r\na=msid:lagoon {}\r\n",
                track.id()
            ));
        }
        sdp
    }

    /// Brings the connection up once both sides are described.
    fn maybe_connect(&self) {
        let remote_kinds = {
            let mut state = self.state.lock();
            if !self.auto_connect || state.connected || state.local.is_none() {
                return;
            }
            let Some(remote) = state.remote.as_ref() else {
                return;
            };
            let kinds = media_kinds(&remote.sdp);
            state.connected = true;
            kinds
        };
        self.fire_state(PeerConnectionState::Connecting);
        for kind in remote_kinds {
            self.fire_track(kind);
        }
        self.fire_state(PeerConnectionState::Connected);
    }

    async fn pass_gate(&self) -> Result<(), EngineError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| EngineError::Closed)?.forget();
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.lock().closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

fn media_kinds(sdp: &str) -> Vec<MediaKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(MediaKind::Audio)
            } else if line.starts_with("m=video") {
                Some(MediaKind::Video)
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &LocalTrack, _stream_id: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state.lock().tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        self.pass_gate().await?;
        let tracks = self.state.lock().tracks.clone();
        Ok(SessionDescription::offer(self.render_sdp(&tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        self.pass_gate().await?;
        let tracks = {
            let state = self.state.lock();
            match state.remote.as_ref() {
                Some(remote) if remote.sdp_type == SdpType::Offer => {}
                _ => {
                    return Err(EngineError::Negotiation(
                        "cannot answer without a remote offer".into(),
                    ));
                }
            }
            state.tracks.clone()
        };
        Ok(SessionDescription::answer(self.render_sdp(&tracks)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pass_gate().await?;
        self.ensure_open()?;
        self.state.lock().local = Some(description);
        self.events.emit(PeerEventKind::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 UDP 2130706431 127.0.0.1 {} typ host",
                self.events.connection().get(),
                40_000 + self.events.connection().get() % 10_000
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pass_gate().await?;
        self.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(EngineError::Negotiation("malformed session description".into()));
        }
        {
            let mut state = self.state.lock();
            let local_is_offer = matches!(
                state.local.as_ref().map(|d| d.sdp_type),
                Some(SdpType::Offer)
            );
            match description.sdp_type {
                SdpType::Answer if !local_is_offer || state.remote.is_some() => {
                    return Err(EngineError::Negotiation(
                        "answer received without an outstanding offer".into(),
                    ));
                }
                SdpType::Offer if state.remote.is_some() => {
                    return Err(EngineError::Negotiation(
                        "offer received in non-stable state".into(),
                    ));
                }
                _ => {}
            }
            state.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(EngineError::Negotiation(
                "remote description not set".into(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            drop(state);
            self.fire_state(PeerConnectionState::Closed);
        }
        Ok(())
    }
}
