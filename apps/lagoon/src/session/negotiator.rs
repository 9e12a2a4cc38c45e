//! Offer/answer/ICE handshake for the single peer connection of a room.
//!
//! Every public operation is a synchronous claim taken under the core lock
//! (state check plus transition) that may hand back a [`Continuation`] for
//! the asynchronous remainder. Continuations carry a [`Ticket`] and re-check
//! it after every await; a continuation whose session was torn down or
//! replaced discards whatever it produced and stops.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::state::{CallStateMachine, Effect, HangupOrigin, SessionInput, SessionState, Transition};
use super::{CallError, CallSnapshot, SessionConfig};
use crate::engine::{
    ConnectionId, IceCandidate, IceServer, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventKind, PeerEventSink, SdpType, SessionDescription,
};
use crate::media::{CallKind, LocalTrack, MediaConstraints, MediaDevices, MediaHandle, RemoteMedia};
use crate::room::{MembershipTracker, Participant, TransportAddress};
use crate::signaling::protocol::{
    CallControl, JoinRoom, OutboundAnswer, OutboundCandidate, OutboundOffer,
};
use crate::signaling::{CallAction, ClientEvent, ConnectionQuality, Relay, SignalingProtocolError};

/// Asynchronous remainder of a claimed operation.
pub type Continuation = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OfferProgress {
    Producing,
    /// Produced while nobody else was in the room.
    Held(SessionDescription),
    Delivered {
        to: TransportAddress,
        answered: bool,
    },
}

#[derive(Clone)]
struct Connection {
    id: ConnectionId,
    pc: Arc<dyn PeerConnection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    connection: Option<ConnectionId>,
}

impl Ticket {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            connection: None,
        }
    }

    fn with_connection(self, connection: ConnectionId) -> Self {
        Self {
            connection: Some(connection),
            ..self
        }
    }
}

struct ActiveCall {
    kind: CallKind,
    role: Role,
    offer: Option<OfferProgress>,
    media: Option<MediaHandle>,
    connection: Option<Connection>,
    /// Handle of the participant this session negotiates with.
    peer: Option<TransportAddress>,
    /// Our own description reached `peer`; local candidates may follow it.
    described: bool,
    remote_description_applied: bool,
    inbound_candidates: Vec<IceCandidate>,
    outbound_candidates: Vec<IceCandidate>,
    remote_media: RemoteMedia,
    muted: bool,
    video_enabled: bool,
}

impl ActiveCall {
    fn new(kind: CallKind, role: Role) -> Self {
        Self {
            kind,
            role,
            offer: (role == Role::Initiator).then_some(OfferProgress::Producing),
            media: None,
            connection: None,
            peer: None,
            described: false,
            remote_description_applied: false,
            inbound_candidates: Vec::new(),
            outbound_candidates: Vec::new(),
            remote_media: RemoteMedia::default(),
            muted: false,
            video_enabled: kind.wants_video(),
        }
    }

    fn offer_delivered(&self) -> bool {
        matches!(self.offer, Some(OfferProgress::Delivered { .. }))
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|connection| connection.id)
    }
}

struct CallCore {
    tracker: MembershipTracker,
    machine: CallStateMachine,
    call: Option<ActiveCall>,
    generation: u64,
    remote_muted: bool,
    last_error: Option<String>,
}

impl CallCore {
    fn begin(&mut self, kind: CallKind, role: Role) -> Ticket {
        if let Some(transition) = self.machine.apply(SessionInput::Start) {
            log_transition(&transition);
        }
        self.generation += 1;
        self.last_error = None;
        self.remote_muted = false;
        self.call = Some(ActiveCall::new(kind, role));
        Ticket::new(self.generation)
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        if self.generation != ticket.generation {
            return false;
        }
        match (ticket.connection, self.call.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(id), Some(call)) => call.connection_id() == Some(id),
        }
    }

    fn current(&mut self, ticket: Ticket) -> Result<&mut ActiveCall, CallError> {
        if !self.is_current(ticket) {
            return Err(CallError::Superseded);
        }
        self.call.as_mut().ok_or(CallError::Superseded)
    }

    /// Drops the session: local tracks stop, the connection is handed back
    /// for closing and every outstanding ticket goes stale.
    fn release(&mut self) -> Released {
        self.generation += 1;
        let connection = self.call.take().and_then(|mut call| {
            if let Some(media) = call.media.take() {
                media.stop();
            }
            call.connection.take()
        });
        Released(connection)
    }

    fn snapshot(&self) -> CallSnapshot {
        let call = self.call.as_ref();
        CallSnapshot {
            state: self.machine.state(),
            call_kind: call.map(|call| call.kind),
            is_muted: call.is_some_and(|call| call.muted),
            is_video_enabled: call.is_some_and(|call| call.video_enabled),
            quality: self.machine.quality(),
            remote: self.tracker.remote().cloned(),
            has_remote_media: call.is_some_and(|call| !call.remote_media.is_empty()),
            remote_muted: self.remote_muted,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Default)]
struct Released(Option<Connection>);

impl Released {
    async fn close(self) {
        let Some(connection) = self.0 else {
            return;
        };
        if let Err(err) = connection.pc.close().await {
            tracing::debug!(
                target = "lagoon::session",
                connection = connection.id.get(),
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OnFailure {
    /// Logged; the session carries on.
    Ignore,
    /// The session is abandoned and the failure shown to the user.
    Abort,
    /// The session is abandoned; only media failures are shown.
    AbortQuietly,
}

fn log_transition(transition: &Transition) {
    tracing::info!(
        target = "lagoon::session",
        from = ?transition.from,
        to = ?transition.to,
        effects = ?transition.effects,
        "session transition"
    );
}

pub struct Negotiator {
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    relay: Arc<dyn Relay>,
    room_id: String,
    ice_servers: Vec<IceServer>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    core: Mutex<CallCore>,
    snapshot: watch::Sender<CallSnapshot>,
}

impl Negotiator {
    /// Builds a negotiator together with the stream its peer connections
    /// report into; feed that stream back through [`Negotiator::on_peer_event`].
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        relay: Arc<dyn Relay>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        let negotiator = Arc::new(Self {
            factory,
            devices,
            relay,
            room_id: config.room_id,
            ice_servers: config.ice_servers,
            peer_events,
            core: Mutex::new(CallCore {
                tracker: MembershipTracker::new(config.local_user_id),
                machine: CallStateMachine::new(),
                call: None,
                generation: 0,
                remote_muted: false,
                last_error: None,
            }),
            snapshot,
        });
        (negotiator, peer_rx)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().machine.state()
    }

    pub fn current_remote_address(&self) -> Option<TransportAddress> {
        self.core.lock().tracker.current_remote_address().cloned()
    }

    pub fn join_room(&self) {
        let user_id = self.core.lock().tracker.local_user_id().to_string();
        tracing::info!(
            target = "lagoon::session",
            room_id = %self.room_id,
            user_id = %user_id,
            "joining room"
        );
        self.emit(ClientEvent::JoinRoom(JoinRoom {
            room_id: self.room_id.clone(),
            user_id,
        }));
    }

    pub fn seed_members(&self, members: Vec<Participant>) {
        let mut core = self.core.lock();
        core.tracker.seed_members(members);
        self.publish(&core);
    }

    /// Returns whether the tracked remote address changed.
    pub fn on_participant_joined(&self, participant: Participant) -> bool {
        let mut core = self.core.lock();
        let changed = core.tracker.on_joined(participant);
        if changed {
            tracing::debug!(
                target = "lagoon::session",
                generation = core.tracker.generation(),
                "remote participant changed"
            );
        }
        self.publish(&core);
        changed
    }

    /// Ends the session when the departing handle is the one we negotiate
    /// with.
    pub fn on_participant_left(&self, participant: &Participant) -> Option<Continuation> {
        let departed_peer = {
            let mut core = self.core.lock();
            core.tracker.on_left(participant);
            self.publish(&core);
            core.call
                .as_ref()
                .and_then(|call| call.peer.as_ref())
                .is_some_and(|peer| *peer == participant.address)
        };
        if departed_peer {
            tracing::info!(
                target = "lagoon::session",
                address = %participant.address,
                "remote participant left the call"
            );
            self.hangup(HangupOrigin::PeerDeparted)
        } else {
            None
        }
    }

    pub fn start_as_initiator(self: &Arc<Self>, kind: CallKind) -> Option<Continuation> {
        let ticket = {
            let mut core = self.core.lock();
            let state = core.machine.state();
            if state != SessionState::Idle {
                tracing::warn!(
                    target = "lagoon::session",
                    state = ?state,
                    "call already in progress; ignoring start"
                );
                return None;
            }
            let ticket = core.begin(kind, Role::Initiator);
            self.publish(&core);
            ticket
        };
        tracing::info!(target = "lagoon::session", kind = %kind, "starting call");
        let this = Arc::clone(self);
        Some(Box::pin(async move {
            let result = this.produce_offer(ticket, kind).await;
            this.settle(ticket, "offer", result, OnFailure::Abort).await;
        }))
    }

    async fn produce_offer(self: &Arc<Self>, ticket: Ticket, kind: CallKind) -> Result<(), CallError> {
        let media = self
            .devices
            .acquire(&MediaConstraints::for_call(kind))
            .await?;
        let (tracks, stream_id) = self.store_media(ticket, media)?;

        let (connection, ticket) = self.open_connection(ticket).await?;
        attach_tracks(&connection, &tracks, &stream_id).await?;
        self.ensure_current(ticket)?;
        let offer = connection.pc.create_offer().await?;
        self.ensure_current(ticket)?;
        connection.pc.set_local_description(offer.clone()).await?;

        let mut core = self.core.lock();
        let target = core.tracker.current_remote_address().cloned();
        let call = core.current(ticket)?;
        match target {
            Some(target) => self.deliver_offer(call, offer, target),
            None => {
                tracing::info!(
                    target = "lagoon::session",
                    "no remote participant yet; holding offer"
                );
                call.offer = Some(OfferProgress::Held(offer));
            }
        }
        Ok(())
    }

    pub fn handle_remote_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
        from: TransportAddress,
    ) -> Option<Continuation> {
        if offer.sdp_type != SdpType::Offer {
            let err = SignalingProtocolError::InvalidDescription(format!(
                "expected an offer from {from}, got {:?}",
                offer.sdp_type
            ));
            tracing::warn!(target = "lagoon::session", error = %err, "ignoring offer");
            return None;
        }
        let (ticket, kind, released) = {
            let mut core = self.core.lock();
            core.tracker.observe_signal_source(&from);
            let state = core.machine.state();
            let adoptable = state == SessionState::Negotiating
                && core.call.as_ref().is_some_and(|call| {
                    call.role == Role::Initiator
                        && (!call.offer_delivered()
                            || yields_to_crossed_offer(&core.tracker, call, &from))
                });

            let claimed = if state == SessionState::Idle {
                let kind = CallKind::infer_from_sdp(&offer.sdp);
                let ticket = core.begin(kind, Role::Answerer);
                core.call.as_mut().map(|call| {
                    call.peer = Some(from.clone());
                    (ticket, kind, Released::default())
                })
            } else if adoptable {
                core.generation += 1;
                let ticket = Ticket::new(core.generation);
                core.call.as_mut().map(|call| {
                    tracing::info!(
                        target = "lagoon::session",
                        from = %from,
                        crossed = call.offer_delivered(),
                        "yielding to remote offer; answering instead"
                    );
                    call.role = Role::Answerer;
                    call.offer = None;
                    call.peer = Some(from.clone());
                    call.described = false;
                    call.remote_description_applied = false;
                    call.outbound_candidates.clear();
                    (ticket, call.kind, Released(call.connection.take()))
                })
            } else {
                tracing::debug!(
                    target = "lagoon::session",
                    state = ?state,
                    from = %from,
                    "ignoring offer; a session is already negotiating"
                );
                None
            };
            self.publish(&core);
            claimed?
        };

        let this = Arc::clone(self);
        Some(Box::pin(async move {
            released.close().await;
            let result = this.answer_offer(ticket, kind, offer, from).await;
            this.settle(ticket, "answer", result, OnFailure::AbortQuietly)
                .await;
        }))
    }

    async fn answer_offer(
        self: &Arc<Self>,
        ticket: Ticket,
        kind: CallKind,
        offer: SessionDescription,
        from: TransportAddress,
    ) -> Result<(), CallError> {
        let held = {
            let mut core = self.core.lock();
            let call = core.current(ticket)?;
            call.media
                .as_ref()
                .map(|media| (media.tracks().to_vec(), media.stream_id().to_string()))
        };
        let (tracks, stream_id) = match held {
            Some(held) => held,
            None => {
                let media = self
                    .devices
                    .acquire(&MediaConstraints::for_call(kind))
                    .await?;
                self.store_media(ticket, media)?
            }
        };

        let (connection, ticket) = self.open_connection(ticket).await?;
        attach_tracks(&connection, &tracks, &stream_id).await?;
        self.ensure_current(ticket)?;
        connection.pc.set_remote_description(offer).await?;
        self.flush_inbound_candidates(ticket, &connection).await?;
        let answer = connection.pc.create_answer().await?;
        self.ensure_current(ticket)?;
        connection.pc.set_local_description(answer.clone()).await?;

        let mut core = self.core.lock();
        let call = core.current(ticket)?;
        self.emit(ClientEvent::Answer(OutboundAnswer {
            answer,
            target_socket_id: from.clone(),
        }));
        self.mark_described(call, from);
        Ok(())
    }

    /// Applies `answer` when it comes from the handle our outstanding offer
    /// went to.
    pub fn handle_remote_answer(
        self: &Arc<Self>,
        answer: SessionDescription,
        from: TransportAddress,
    ) -> Option<Continuation> {
        if answer.sdp_type != SdpType::Answer {
            let err = SignalingProtocolError::InvalidDescription(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            ));
            tracing::warn!(target = "lagoon::session", error = %err, "ignoring answer");
            return None;
        }
        let (ticket, connection) = {
            let mut core = self.core.lock();
            let generation = core.generation;
            let Some(call) = core.call.as_mut() else {
                tracing::debug!(target = "lagoon::session", "no session; ignoring answer");
                return None;
            };
            let awaiting = matches!(
                &call.offer,
                Some(OfferProgress::Delivered { to, answered: false }) if *to == from
            );
            let connection = match call.connection.clone() {
                Some(connection) if awaiting => {
                    if let Some(OfferProgress::Delivered { answered, .. }) = call.offer.as_mut() {
                        *answered = true;
                    }
                    connection
                }
                _ => {
                    tracing::debug!(
                        target = "lagoon::session",
                        role = ?call.role,
                        from = %from,
                        "no outstanding offer to this sender; ignoring answer"
                    );
                    return None;
                }
            };
            (Ticket::new(generation).with_connection(connection.id), connection)
        };

        let this = Arc::clone(self);
        Some(Box::pin(async move {
            let result = this.apply_answer(ticket, &connection, answer).await;
            this.settle(ticket, "apply answer", result, OnFailure::Ignore)
                .await;
        }))
    }

    async fn apply_answer(
        &self,
        ticket: Ticket,
        connection: &Connection,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        if let Err(err) = connection.pc.set_remote_description(answer).await {
            let mut core = self.core.lock();
            if let Ok(call) = core.current(ticket) {
                if let Some(OfferProgress::Delivered { answered, .. }) = call.offer.as_mut() {
                    *answered = false;
                }
            }
            return Err(err.into());
        }
        self.flush_inbound_candidates(ticket, connection).await
    }

    pub fn handle_remote_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
        from: TransportAddress,
    ) -> Option<Continuation> {
        let Some(candidate) = candidate else {
            tracing::trace!(target = "lagoon::session", "remote candidate gathering finished");
            return None;
        };
        let connection = {
            let mut core = self.core.lock();
            let Some(call) = core.call.as_mut() else {
                tracing::debug!(
                    target = "lagoon::session",
                    "no active session; dropping remote candidate"
                );
                return None;
            };
            if call.peer.as_ref() != Some(&from) {
                tracing::debug!(
                    target = "lagoon::session",
                    from = %from,
                    "candidate from a handle we are not negotiating with; dropping"
                );
                return None;
            }
            match call.connection.clone() {
                Some(connection) if call.remote_description_applied => connection,
                _ => {
                    tracing::trace!(
                        target = "lagoon::session",
                        buffered = call.inbound_candidates.len() + 1,
                        "remote description pending; buffering candidate"
                    );
                    call.inbound_candidates.push(candidate);
                    return None;
                }
            }
        };
        Some(Box::pin(async move {
            add_remote_candidate(&connection, candidate).await;
        }))
    }

    /// After a participant joins: sends a held offer, or restarts an offer
    /// that went to a handle which is no longer the tracked one.
    pub fn renegotiate_if_joined_during_active_call(self: &Arc<Self>) -> Option<Continuation> {
        let (kind, released) = {
            let mut core = self.core.lock();
            let target = core.tracker.current_remote_address().cloned()?;
            let call = core.call.as_mut()?;
            let kind = call.kind;
            match (call.role, call.offer.clone()) {
                (Role::Initiator, Some(OfferProgress::Held(offer))) => {
                    tracing::info!(
                        target = "lagoon::session",
                        to = %target,
                        "participant joined; sending held offer"
                    );
                    self.deliver_offer(call, offer, target);
                    self.publish(&core);
                    return None;
                }
                (Role::Initiator, Some(OfferProgress::Delivered { to, .. })) if to != target => {
                    tracing::info!(
                        target = "lagoon::session",
                        previous = %to,
                        current = %target,
                        generation = core.tracker.generation(),
                        "participant rejoined with a new handle; restarting call"
                    );
                    let released = self.abort_locked(&mut core);
                    self.publish(&core);
                    (kind, released)
                }
                _ => return None,
            }
        };
        let restart = self.start_as_initiator(kind);
        Some(Box::pin(async move {
            released.close().await;
            if let Some(restart) = restart {
                restart.await;
            }
        }))
    }

    pub fn hangup(&self, origin: HangupOrigin) -> Option<Continuation> {
        let released = {
            let mut core = self.core.lock();
            let Some(transition) = core.machine.apply(SessionInput::Hangup(origin)) else {
                tracing::debug!(
                    target = "lagoon::session",
                    origin = ?origin,
                    "no active call; ignoring hangup"
                );
                return None;
            };
            log_transition(&transition);
            if transition.has(Effect::EmitHangup) {
                self.emit(self.control(CallAction::Hangup));
            }
            let released = if transition.has(Effect::Teardown) {
                core.release()
            } else {
                Released::default()
            };
            let mut closed = core.snapshot();
            closed.state = transition.to;
            self.snapshot.send_replace(closed);
            self.publish(&core);
            released
        };
        Some(Box::pin(released.close()))
    }

    /// Releases everything the session holds. Safe to call at any time and
    /// any number of times.
    pub async fn teardown(&self) {
        let released = {
            let mut core = self.core.lock();
            if core.call.is_none() && !core.machine.state().is_active() {
                return;
            }
            let released = self.abort_locked(&mut core);
            self.publish(&core);
            released
        };
        released.close().await;
    }

    pub fn toggle_mute(&self) {
        let mut core = self.core.lock();
        let Some(call) = core.call.as_mut() else {
            return;
        };
        let Some(media) = call.media.as_ref() else {
            tracing::debug!(target = "lagoon::session", "no local media; ignoring mute");
            return;
        };
        let muted = !call.muted;
        media.set_audio_enabled(!muted);
        call.muted = muted;
        tracing::info!(target = "lagoon::session", muted, "toggled microphone");
        let action = if muted {
            CallAction::Mute
        } else {
            CallAction::Unmute
        };
        self.emit(self.control(action));
        self.publish(&core);
    }

    pub fn toggle_video(&self) {
        let mut core = self.core.lock();
        let Some(call) = core.call.as_mut() else {
            return;
        };
        let Some(media) = call.media.as_ref().filter(|media| media.has_video()) else {
            tracing::debug!(target = "lagoon::session", "no local video; ignoring toggle");
            return;
        };
        let enabled = !call.video_enabled;
        media.set_video_enabled(enabled);
        call.video_enabled = enabled;
        tracing::info!(target = "lagoon::session", enabled, "toggled camera");
        self.publish(&core);
    }

    pub fn set_remote_muted(&self, muted: bool) {
        let mut core = self.core.lock();
        core.remote_muted = muted;
        self.publish(&core);
    }

    pub fn set_connection_quality(&self, quality: ConnectionQuality) {
        let mut core = self.core.lock();
        core.machine.set_quality(quality);
        self.publish(&core);
    }

    pub fn on_peer_event(&self, event: PeerEvent) {
        let mut core = self.core.lock();
        let active = core.call.as_ref().and_then(ActiveCall::connection_id);
        if active != Some(event.connection) {
            tracing::trace!(
                target = "lagoon::session",
                connection = event.connection.get(),
                "discarding event from inactive connection"
            );
            return;
        }
        let input = match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                if let Some(call) = core.call.as_mut() {
                    self.send_local_candidate(call, candidate);
                }
                None
            }
            PeerEventKind::Track(track) => {
                tracing::debug!(
                    target = "lagoon::session",
                    track = %track.id,
                    kind = ?track.kind,
                    "remote track arrived"
                );
                if let Some(call) = core.call.as_mut() {
                    call.remote_media.add(track);
                }
                Some(SessionInput::RemoteTrack)
            }
            PeerEventKind::ConnectionState(state) => {
                tracing::debug!(
                    target = "lagoon::session",
                    connection = event.connection.get(),
                    state = ?state,
                    "peer connection state"
                );
                if state.is_live() {
                    Some(SessionInput::TransportLive)
                } else if state.is_lost() || state == PeerConnectionState::Closed {
                    Some(SessionInput::TransportLost)
                } else {
                    None
                }
            }
        };
        if let Some(transition) = input.and_then(|input| core.machine.apply(input)) {
            log_transition(&transition);
        }
        self.publish(&core);
    }

    fn ensure_current(&self, ticket: Ticket) -> Result<(), CallError> {
        self.core.lock().current(ticket).map(|_| ())
    }

    fn store_media(
        &self,
        ticket: Ticket,
        media: MediaHandle,
    ) -> Result<(Vec<LocalTrack>, String), CallError> {
        let mut core = self.core.lock();
        let call = core.current(ticket)?;
        let attached = (media.tracks().to_vec(), media.stream_id().to_string());
        call.media = Some(media);
        self.publish(&core);
        Ok(attached)
    }

    async fn open_connection(&self, ticket: Ticket) -> Result<(Connection, Ticket), CallError> {
        let id = ConnectionId::next();
        let events = PeerEventSink::new(id, self.peer_events.clone());
        let pc = self.factory.create(&self.ice_servers, events).await?;
        let connection = Connection { id, pc };
        let adopted = {
            let mut core = self.core.lock();
            match core.current(ticket) {
                Ok(call) => {
                    call.connection = Some(connection.clone());
                    true
                }
                Err(_) => false,
            }
        };
        if !adopted {
            Released(Some(connection)).close().await;
            return Err(CallError::Superseded);
        }
        tracing::debug!(
            target = "lagoon::session",
            connection = id.get(),
            "peer connection opened"
        );
        Ok((connection, ticket.with_connection(id)))
    }

    async fn flush_inbound_candidates(
        &self,
        ticket: Ticket,
        connection: &Connection,
    ) -> Result<(), CallError> {
        let buffered = {
            let mut core = self.core.lock();
            let call = core.current(ticket)?;
            call.remote_description_applied = true;
            std::mem::take(&mut call.inbound_candidates)
        };
        for candidate in buffered {
            add_remote_candidate(connection, candidate).await;
        }
        Ok(())
    }

    fn deliver_offer(&self, call: &mut ActiveCall, offer: SessionDescription, to: TransportAddress) {
        tracing::info!(target = "lagoon::session", to = %to, "sending offer");
        self.emit(ClientEvent::Offer(OutboundOffer {
            offer,
            target_socket_id: to.clone(),
            room_id: self.room_id.clone(),
        }));
        call.offer = Some(OfferProgress::Delivered {
            to: to.clone(),
            answered: false,
        });
        self.mark_described(call, to);
    }

    /// Our description reached `to`; queued local candidates follow it.
    fn mark_described(&self, call: &mut ActiveCall, to: TransportAddress) {
        call.peer = Some(to);
        call.described = true;
        for candidate in std::mem::take(&mut call.outbound_candidates) {
            self.send_local_candidate(call, candidate);
        }
    }

    fn send_local_candidate(&self, call: &mut ActiveCall, candidate: IceCandidate) {
        match call.peer.as_ref().filter(|_| call.described) {
            Some(peer) => self.emit(ClientEvent::IceCandidate(OutboundCandidate {
                candidate,
                target_socket_id: peer.clone(),
            })),
            None => call.outbound_candidates.push(candidate),
        }
    }

    fn abort_locked(&self, core: &mut CallCore) -> Released {
        if let Some(transition) = core.machine.apply(SessionInput::Abort) {
            log_transition(&transition);
        }
        core.release()
    }

    async fn settle(
        &self,
        ticket: Ticket,
        step: &'static str,
        result: Result<(), CallError>,
        on_failure: OnFailure,
    ) {
        let Err(err) = result else {
            return;
        };
        let released = {
            let mut core = self.core.lock();
            if matches!(err, CallError::Superseded) || !core.is_current(ticket) {
                tracing::debug!(target = "lagoon::session", step, "negotiation superseded");
                return;
            }
            let record = match on_failure {
                OnFailure::Ignore => {
                    tracing::warn!(target = "lagoon::session", step, error = %err, "negotiation step failed");
                    return;
                }
                OnFailure::Abort => true,
                OnFailure::AbortQuietly => matches!(err, CallError::Media(_)),
            };
            tracing::warn!(
                target = "lagoon::session",
                step,
                error = %err,
                "negotiation failed; abandoning call"
            );
            let released = self.abort_locked(&mut core);
            if record {
                core.last_error = Some(err.user_message());
            }
            self.publish(&core);
            released
        };
        released.close().await;
    }

    fn control(&self, action: CallAction) -> ClientEvent {
        ClientEvent::CallControl(CallControl {
            action,
            room_id: self.room_id.clone(),
        })
    }

    fn emit(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(err) = self.relay.emit(event) {
            tracing::warn!(
                target = "lagoon::session",
                event = name,
                error = %err,
                "relay emission failed"
            );
        }
    }

    fn publish(&self, core: &CallCore) {
        let next = core.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Both sides delivered offers to each other. The side with the lower user
/// id answers; the other keeps waiting for that answer.
fn yields_to_crossed_offer(
    tracker: &MembershipTracker,
    call: &ActiveCall,
    from: &TransportAddress,
) -> bool {
    let crossed = matches!(
        &call.offer,
        Some(OfferProgress::Delivered { to, answered: false }) if to == from
    );
    crossed
        && tracker.remote().is_some_and(|remote| {
            remote.address == *from
                && !remote.user_id.is_empty()
                && tracker.local_user_id() < remote.user_id.as_str()
        })
}

async fn attach_tracks(
    connection: &Connection,
    tracks: &[LocalTrack],
    stream_id: &str,
) -> Result<(), CallError> {
    for track in tracks {
        connection.pc.add_track(track, stream_id).await?;
    }
    Ok(())
}

async fn add_remote_candidate(connection: &Connection, candidate: IceCandidate) {
    if let Err(err) = connection.pc.add_ice_candidate(candidate).await {
        let err = SignalingProtocolError::InvalidCandidate(err.to_string());
        tracing::warn!(
            target = "lagoon::session",
            connection = connection.id.get(),
            error = %err,
            "remote candidate rejected"
        );
    }
}
