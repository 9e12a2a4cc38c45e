use serde::Serialize;

use crate::signaling::ConnectionQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Degraded,
    /// Terminal; the machine is back in `Idle` by the time anyone can look.
    Closed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Connected | SessionState::Degraded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupOrigin {
    Local,
    Remote,
    PeerDeparted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    Start,
    RemoteTrack,
    TransportLive,
    TransportLost,
    Hangup(HangupOrigin),
    /// The attempt failed before a call existed (media denied, bad offer).
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Teardown,
    EmitHangup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn has(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }
}

/// The one authoritative record of where the call is.
#[derive(Debug, Default)]
pub struct CallStateMachine {
    state: SessionState,
    remote_track: bool,
    transport_live: bool,
    quality: ConnectionQuality,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    /// The relay's own verdict on link quality overrides ours until the next
    /// transport change.
    pub fn set_quality(&mut self, quality: ConnectionQuality) {
        self.quality = quality;
    }

    /// Applies `input`. Returns `None` when the input does not move the
    /// machine (and therefore requires no effects).
    pub fn apply(&mut self, input: SessionInput) -> Option<Transition> {
        let from = self.state;
        let effects = match (from, input) {
            (SessionState::Idle, SessionInput::Start) => {
                self.reset_flags();
                self.state = SessionState::Negotiating;
                Vec::new()
            }
            (SessionState::Negotiating, SessionInput::RemoteTrack) => {
                self.remote_track = true;
                return self.try_connect(from);
            }
            (SessionState::Negotiating, SessionInput::TransportLive) => {
                self.transport_live = true;
                return self.try_connect(from);
            }
            (SessionState::Negotiating, SessionInput::TransportLost) => {
                self.transport_live = false;
                return None;
            }
            (SessionState::Connected | SessionState::Degraded, SessionInput::RemoteTrack) => {
                self.remote_track = true;
                return None;
            }
            (SessionState::Connected, SessionInput::TransportLost) => {
                self.transport_live = false;
                self.quality = ConnectionQuality::Poor;
                self.state = SessionState::Degraded;
                Vec::new()
            }
            (SessionState::Degraded, SessionInput::TransportLive) => {
                self.transport_live = true;
                self.quality = ConnectionQuality::Good;
                self.state = SessionState::Connected;
                Vec::new()
            }
            (state, SessionInput::Hangup(origin)) if state.is_active() => {
                let mut effects = vec![Effect::Teardown];
                if origin == HangupOrigin::Local {
                    effects.push(Effect::EmitHangup);
                }
                self.reset_flags();
                self.state = SessionState::Idle;
                return Some(Transition {
                    from,
                    to: SessionState::Closed,
                    effects,
                });
            }
            (state, SessionInput::Abort) if state.is_active() => {
                self.reset_flags();
                self.state = SessionState::Idle;
                vec![Effect::Teardown]
            }
            _ => return None,
        };
        Some(Transition {
            from,
            to: self.state,
            effects,
        })
    }

    fn try_connect(&mut self, from: SessionState) -> Option<Transition> {
        if !(self.remote_track && self.transport_live) {
            return None;
        }
        self.state = SessionState::Connected;
        self.quality = ConnectionQuality::Good;
        Some(Transition {
            from,
            to: SessionState::Connected,
            effects: Vec::new(),
        })
    }

    fn reset_flags(&mut self) {
        self.remote_track = false;
        self.transport_live = false;
        self.quality = ConnectionQuality::Good;
    }
}
