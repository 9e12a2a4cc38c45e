use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::{
    CallControl, ClientEvent, ConnectionQuality, InboundAnswer, InboundCandidate, InboundOffer,
    JoinedRoom, QualityUpdate, RoomMember,
};
use super::{Relay, RelayError, RelayEvent};
use crate::room::TransportAddress;

const ROOM_CAPACITY: usize = 2;

/// In-process stand-in for the relay service: assigns socket ids, keeps
/// rooms of at most two members and routes events between clients.
#[derive(Default)]
pub struct LocalRelayHub {
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<TransportAddress, ClientEntry>,
    rooms: HashMap<String, Vec<TransportAddress>>,
    sent: Vec<(TransportAddress, ClientEvent)>,
}

struct ClientEntry {
    user_id: Option<String>,
    room: Option<String>,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl LocalRelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a client connection. Dropping the returned relay disconnects it.
    pub fn connect(self: &Arc<Self>) -> (LocalRelay, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = TransportAddress::new(format!("sock-{}", Uuid::new_v4().simple()));
        self.state.lock().clients.insert(
            address.clone(),
            ClientEntry {
                user_id: None,
                room: None,
                tx,
            },
        );
        tracing::debug!(target = "lagoon::relay", address = %address, "client connected");
        let relay = LocalRelay {
            hub: Arc::clone(self),
            address,
        };
        (relay, rx)
    }

    /// Events emitted by `from` with the given relay name.
    pub fn sent_by(&self, from: &TransportAddress, name: &str) -> Vec<ClientEvent> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(sender, event)| sender == from && event.name() == name)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn members(&self, room_id: &str) -> Vec<TransportAddress> {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes a server-side quality verdict to everyone in the room.
    pub fn report_quality(&self, room_id: &str, quality: ConnectionQuality) {
        let state = self.state.lock();
        for member in state.rooms.get(room_id).into_iter().flatten() {
            state.deliver(
                member,
                RelayEvent::ConnectionQualityUpdate(QualityUpdate { quality }),
            );
        }
    }

    fn route(&self, from: &TransportAddress, event: ClientEvent) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(from) {
            return Err(RelayError::Closed);
        }
        state.sent.push((from.clone(), event.clone()));
        match event {
            ClientEvent::JoinRoom(join) => state.join(from, join.room_id, join.user_id),
            ClientEvent::Offer(offer) => {
                let target = offer.target_socket_id.clone();
                state.deliver(
                    &target,
                    RelayEvent::Offer(InboundOffer {
                        offer: offer.offer,
                        from_socket_id: from.clone(),
                        room_id: Some(offer.room_id),
                    }),
                );
            }
            ClientEvent::Answer(answer) => {
                let target = answer.target_socket_id.clone();
                state.deliver(
                    &target,
                    RelayEvent::Answer(InboundAnswer {
                        answer: answer.answer,
                        from_socket_id: from.clone(),
                    }),
                );
            }
            ClientEvent::IceCandidate(candidate) => {
                let target = candidate.target_socket_id.clone();
                state.deliver(
                    &target,
                    RelayEvent::IceCandidate(InboundCandidate {
                        candidate: Some(candidate.candidate),
                        from_socket_id: from.clone(),
                    }),
                );
            }
            ClientEvent::CallControl(control) => {
                let event = RelayEvent::CallControl(CallControl {
                    action: control.action,
                    room_id: control.room_id.clone(),
                });
                state.broadcast(&control.room_id, from, event);
            }
        }
        Ok(())
    }

    fn disconnect(&self, address: &TransportAddress) {
        let mut state = self.state.lock();
        let Some(entry) = state.clients.remove(address) else {
            return;
        };
        tracing::debug!(target = "lagoon::relay", address = %address, "client disconnected");
        if let Some(room_id) = entry.room {
            if let Some(members) = state.rooms.get_mut(&room_id) {
                members.retain(|member| member != address);
                if members.is_empty() {
                    state.rooms.remove(&room_id);
                }
            }
            let left = RelayEvent::UserLeft(RoomMember {
                socket_id: address.clone(),
                user_id: entry.user_id.unwrap_or_default(),
                username: None,
            });
            state.broadcast(&room_id, address, left);
        }
    }
}

impl HubState {
    fn join(&mut self, from: &TransportAddress, room_id: String, user_id: String) {
        let occupants = self.rooms.get(&room_id).cloned().unwrap_or_default();
        if occupants.contains(from) {
            return;
        }
        if occupants.len() >= ROOM_CAPACITY {
            tracing::warn!(
                target = "lagoon::relay",
                room_id = %room_id,
                address = %from,
                "room full; join refused"
            );
            return;
        }
        let members = occupants
            .iter()
            .filter_map(|address| {
                self.clients.get(address).map(|client| RoomMember {
                    socket_id: address.clone(),
                    user_id: client.user_id.clone().unwrap_or_default(),
                    username: None,
                })
            })
            .collect();

        if let Some(client) = self.clients.get_mut(from) {
            client.user_id = Some(user_id.clone());
            client.room = Some(room_id.clone());
        }
        self.rooms.entry(room_id.clone()).or_default().push(from.clone());

        self.deliver(
            from,
            RelayEvent::JoinedRoom(JoinedRoom {
                room_id: room_id.clone(),
                members,
            }),
        );
        let joined = RelayEvent::UserJoined(RoomMember {
            socket_id: from.clone(),
            user_id,
            username: None,
        });
        self.broadcast(&room_id, from, joined);
    }

    fn deliver(&self, to: &TransportAddress, event: RelayEvent) {
        match self.clients.get(to) {
            Some(client) => {
                if client.tx.send(event).is_err() {
                    tracing::debug!(target = "lagoon::relay", to = %to, "receiver dropped");
                }
            }
            None => tracing::debug!(
                target = "lagoon::relay",
                to = %to,
                "dropping event for unknown socket"
            ),
        }
    }

    fn broadcast(&self, room_id: &str, except: &TransportAddress, event: RelayEvent) {
        for member in self.rooms.get(room_id).into_iter().flatten() {
            if member != except {
                self.deliver(member, event.clone());
            }
        }
    }
}

/// One client's connection to a [`LocalRelayHub`].
pub struct LocalRelay {
    hub: Arc<LocalRelayHub>,
    address: TransportAddress,
}

impl LocalRelay {
    pub fn address(&self) -> &TransportAddress {
        &self.address
    }
}

impl Relay for LocalRelay {
    fn emit(&self, event: ClientEvent) -> Result<(), RelayError> {
        self.hub.route(&self.address, event)
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        self.hub.disconnect(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SessionDescription;
    use crate::signaling::protocol::{JoinRoom, OutboundOffer};

    fn join(relay: &LocalRelay, room: &str, user: &str) {
        relay
            .emit(ClientEvent::JoinRoom(JoinRoom {
                room_id: room.into(),
                user_id: user.into(),
            }))
            .unwrap();
    }

    #[test]
    fn join_announces_to_existing_members() {
        let hub = LocalRelayHub::new();
        let (a, mut a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();

        join(&a, "r1", "alice");
        assert!(matches!(
            a_rx.try_recv().unwrap(),
            RelayEvent::JoinedRoom(JoinedRoom { ref members, .. }) if members.is_empty()
        ));

        join(&b, "r1", "bob");
        match b_rx.try_recv().unwrap() {
            RelayEvent::JoinedRoom(joined) => {
                assert_eq!(joined.members.len(), 1);
                assert_eq!(&joined.members[0].socket_id, a.address());
            }
            other => panic!("unexpected {other:?}"),
        }
        match a_rx.try_recv().unwrap() {
            RelayEvent::UserJoined(member) => {
                assert_eq!(&member.socket_id, b.address());
                assert_eq!(member.user_id, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn targeted_events_carry_sender() {
        let hub = LocalRelayHub::new();
        let (a, _a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        a.emit(ClientEvent::Offer(OutboundOffer {
            offer: SessionDescription::offer("v=0"),
            target_socket_id: b.address().clone(),
            room_id: "r1".into(),
        }))
        .unwrap();
        match b_rx.try_recv().unwrap() {
            RelayEvent::Offer(offer) => assert_eq!(&offer.from_socket_id, a.address()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hub.sent_by(a.address(), "offer").len(), 1);
    }

    #[test]
    fn third_member_is_refused() {
        let hub = LocalRelayHub::new();
        let (a, _a_rx) = hub.connect();
        let (b, _b_rx) = hub.connect();
        let (c, mut c_rx) = hub.connect();
        join(&a, "r1", "alice");
        join(&b, "r1", "bob");
        join(&c, "r1", "carol");
        assert_eq!(hub.members("r1").len(), 2);
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn dropping_a_client_announces_departure() {
        let hub = LocalRelayHub::new();
        let (a, mut a_rx) = hub.connect();
        let (b, _b_rx) = hub.connect();
        join(&a, "r1", "alice");
        join(&b, "r1", "bob");
        let b_address = b.address().clone();
        drop(b);

        let events: Vec<_> = std::iter::from_fn(|| a_rx.try_recv().ok()).collect();
        assert!(events.iter().any(|event| matches!(
            event,
            RelayEvent::UserLeft(member) if member.socket_id == b_address
        )));
        assert_eq!(hub.members("r1"), vec![a.address().clone()]);
    }
}
