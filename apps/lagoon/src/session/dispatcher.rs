use std::sync::Arc;
use std::task::Poll;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::negotiator::{Continuation, Negotiator};
use super::state::HangupOrigin;
use super::{CallError, CallSnapshot, SessionConfig};
use crate::engine::{PeerConnectionFactory, PeerEvent};
use crate::media::{CallKind, MediaDevices};
use crate::signaling::{CallAction, Relay, RelayEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCall(CallKind),
    ToggleMute,
    ToggleVideo,
    Hangup,
    Shutdown,
}

/// User-facing side of a running [`CallController`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn start_video_call(&self) -> Result<(), CallError> {
        self.send(Command::StartCall(CallKind::Video))
    }

    pub fn start_voice_call(&self) -> Result<(), CallError> {
        self.send(Command::StartCall(CallKind::Voice))
    }

    pub fn toggle_mute(&self) -> Result<(), CallError> {
        self.send(Command::ToggleMute)
    }

    pub fn toggle_video(&self) -> Result<(), CallError> {
        self.send(Command::ToggleVideo)
    }

    pub fn hangup(&self) -> Result<(), CallError> {
        self.send(Command::Hangup)
    }

    pub fn shutdown(&self) -> Result<(), CallError> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    /// Resolves with the first snapshot satisfying `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, CallError> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        Ok(snapshot.clone())
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::ControllerStopped)
    }
}

/// Owns the negotiator and multiplexes relay events, user commands and peer
/// events on one task.
pub struct CallController {
    negotiator: Arc<Negotiator>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl CallController {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        relay: Arc<dyn Relay>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> (Self, CallHandle) {
        let (negotiator, peer_events) = Negotiator::new(config, factory, devices, relay);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let handle = CallHandle {
            commands: command_tx,
            state: negotiator.subscribe(),
        };
        let controller = Self {
            negotiator,
            relay_events,
            peer_events,
            commands,
        };
        (controller, handle)
    }

    pub fn spawn(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        relay: Arc<dyn Relay>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> (CallHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(config, factory, devices, relay, relay_events);
        (handle, tokio::spawn(controller.run()))
    }

    /// Joins the room and serves until shutdown or until the relay closes.
    pub async fn run(mut self) {
        self.negotiator.join_room();
        let mut inflight: FuturesUnordered<Continuation> = FuturesUnordered::new();
        loop {
            let continuation = tokio::select! {
                Some(()) = inflight.next(), if !inflight.is_empty() => None,
                event = self.relay_events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        tracing::info!(target = "lagoon::dispatch", "relay closed; stopping");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
                Some(event) = self.peer_events.recv() => {
                    self.negotiator.on_peer_event(event);
                    None
                }
            };
            if let Some(continuation) = continuation {
                inflight.push(continuation);
            }
            drive(&mut inflight).await;
        }

        drop(inflight);
        if let Some(hangup) = self.negotiator.hangup(HangupOrigin::Local) {
            hangup.await;
        }
        self.negotiator.teardown().await;
        tracing::info!(target = "lagoon::dispatch", "call controller stopped");
    }

    fn dispatch(&self, event: RelayEvent) -> Option<Continuation> {
        let negotiator = &self.negotiator;
        match event {
            RelayEvent::JoinedRoom(joined) => {
                tracing::info!(
                    target = "lagoon::dispatch",
                    room_id = %joined.room_id,
                    members = joined.members.len(),
                    "joined room"
                );
                negotiator.seed_members(joined.members.into_iter().map(Into::into).collect());
                negotiator.renegotiate_if_joined_during_active_call()
            }
            RelayEvent::UserJoined(member) => {
                negotiator.on_participant_joined(member.into());
                negotiator.renegotiate_if_joined_during_active_call()
            }
            RelayEvent::UserLeft(member) => negotiator.on_participant_left(&member.into()),
            RelayEvent::Offer(offer) => {
                if offer
                    .room_id
                    .as_deref()
                    .is_some_and(|room_id| room_id != negotiator.room_id())
                {
                    tracing::debug!(
                        target = "lagoon::dispatch",
                        from = %offer.from_socket_id,
                        "ignoring offer for another room"
                    );
                    return None;
                }
                negotiator.handle_remote_offer(offer.offer, offer.from_socket_id)
            }
            RelayEvent::Answer(answer) => {
                negotiator.handle_remote_answer(answer.answer, answer.from_socket_id)
            }
            RelayEvent::IceCandidate(candidate) => {
                negotiator.handle_remote_ice_candidate(candidate.candidate, candidate.from_socket_id)
            }
            RelayEvent::CallControl(control) => {
                if !control.room_id.is_empty() && control.room_id != negotiator.room_id() {
                    tracing::debug!(
                        target = "lagoon::dispatch",
                        room_id = %control.room_id,
                        "ignoring call-control for another room"
                    );
                    return None;
                }
                match control.action {
                    CallAction::Hangup => negotiator.hangup(HangupOrigin::Remote),
                    CallAction::Mute => {
                        negotiator.set_remote_muted(true);
                        None
                    }
                    CallAction::Unmute => {
                        negotiator.set_remote_muted(false);
                        None
                    }
                }
            }
            RelayEvent::ConnectionQualityUpdate(update) => {
                negotiator.set_connection_quality(update.quality);
                None
            }
        }
    }

    fn execute(&self, command: Command) -> Option<Continuation> {
        tracing::debug!(target = "lagoon::dispatch", ?command, "user command");
        match command {
            Command::StartCall(kind) => self.negotiator.start_as_initiator(kind),
            Command::ToggleMute => {
                self.negotiator.toggle_mute();
                None
            }
            Command::ToggleVideo => {
                self.negotiator.toggle_video();
                None
            }
            Command::Hangup => self.negotiator.hangup(HangupOrigin::Local),
            Command::Shutdown => None,
        }
    }
}

/// Polls in-flight continuations until every one of them is suspended, so
/// each handler runs up to its first real wait before the next event.
async fn drive(inflight: &mut FuturesUnordered<Continuation>) {
    while let Poll::Ready(Some(())) = futures_util::poll!(inflight.next()) {}
}
