//! Relay event vocabulary. Frames travel as JSON text
//! `{"event": "<name>", "data": {...}}` with camelCase payload fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SignalingProtocolError;
use crate::engine::{IceCandidate, SessionDescription};
use crate::room::{Participant, TransportAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    Mute,
    Unmute,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Good,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub socket_id: TransportAddress,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl From<RoomMember> for Participant {
    fn from(member: RoomMember) -> Self {
        Participant {
            user_id: member.user_id,
            username: member.username,
            address: member.socket_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoom {
    pub room_id: String,
    #[serde(default)]
    pub members: Vec<RoomMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundOffer {
    pub offer: SessionDescription,
    pub target_socket_id: TransportAddress,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundOffer {
    pub offer: SessionDescription,
    pub from_socket_id: TransportAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAnswer {
    pub answer: SessionDescription,
    pub target_socket_id: TransportAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAnswer {
    pub answer: SessionDescription,
    pub from_socket_id: TransportAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCandidate {
    pub candidate: IceCandidate,
    pub target_socket_id: TransportAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCandidate {
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
    pub from_socket_id: TransportAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControl {
    pub action: CallAction,
    #[serde(default)]
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityUpdate {
    pub quality: ConnectionQuality,
}

/// Events this client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    Offer(OutboundOffer),
    Answer(OutboundAnswer),
    IceCandidate(OutboundCandidate),
    CallControl(CallControl),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::Offer(_) => "offer",
            ClientEvent::Answer(_) => "answer",
            ClientEvent::IceCandidate(_) => "ice-candidate",
            ClientEvent::CallControl(_) => "call-control",
        }
    }

    /// Destination handle for targeted events; broadcasts return `None`.
    pub fn target(&self) -> Option<&TransportAddress> {
        match self {
            ClientEvent::Offer(offer) => Some(&offer.target_socket_id),
            ClientEvent::Answer(answer) => Some(&answer.target_socket_id),
            ClientEvent::IceCandidate(candidate) => Some(&candidate.target_socket_id),
            ClientEvent::JoinRoom(_) | ClientEvent::CallControl(_) => None,
        }
    }
}

/// Events the relay delivers to this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    JoinedRoom(JoinedRoom),
    UserJoined(RoomMember),
    UserLeft(RoomMember),
    Offer(InboundOffer),
    Answer(InboundAnswer),
    IceCandidate(InboundCandidate),
    CallControl(CallControl),
    ConnectionQualityUpdate(QualityUpdate),
}

const RELAY_EVENT_NAMES: &[&str] = &[
    "joined-room",
    "user-joined",
    "user-left",
    "offer",
    "answer",
    "ice-candidate",
    "call-control",
    "connection-quality-update",
];

pub fn encode_client_event(event: &ClientEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Decodes one relay frame. Frames for events this client does not handle
/// (chat, presence extras) come back as `UnknownEvent` so callers can skip
/// them quietly; frames for known events with a bad payload are `Malformed`.
pub fn decode_relay_event(text: &str) -> Result<RelayEvent, SignalingProtocolError> {
    match serde_json::from_str::<RelayEvent>(text) {
        Ok(event) => Ok(event),
        Err(err) => {
            let raw: Value = serde_json::from_str(text)
                .map_err(|_| SignalingProtocolError::Malformed(err.to_string()))?;
            match raw.get("event").and_then(Value::as_str) {
                Some(name) if !RELAY_EVENT_NAMES.contains(&name) => {
                    Err(SignalingProtocolError::UnknownEvent(name.to_string()))
                }
                _ => Err(SignalingProtocolError::Malformed(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_uses_relay_field_names() {
        let event = ClientEvent::Offer(OutboundOffer {
            offer: SessionDescription::offer("v=0"),
            target_socket_id: "sock-b".into(),
            room_id: "r1".into(),
        });
        let value: Value = serde_json::from_str(&encode_client_event(&event).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "offer",
                "data": {
                    "offer": {"type": "offer", "sdp": "v=0"},
                    "targetSocketId": "sock-b",
                    "roomId": "r1"
                }
            })
        );
    }

    #[test]
    fn decodes_inbound_offer_and_candidate() {
        let offer = decode_relay_event(
            r#"{"event":"offer","data":{"offer":{"type":"offer","sdp":"v=0"},"fromSocketId":"a"}}"#,
        )
        .unwrap();
        assert!(matches!(
            offer,
            RelayEvent::Offer(InboundOffer { ref from_socket_id, .. }) if from_socket_id.as_str() == "a"
        ));

        let empty = decode_relay_event(
            r#"{"event":"ice-candidate","data":{"candidate":null,"fromSocketId":"a"}}"#,
        )
        .unwrap();
        assert!(matches!(
            empty,
            RelayEvent::IceCandidate(InboundCandidate { candidate: None, .. })
        ));
    }

    #[test]
    fn decodes_call_control_and_quality() {
        let control = decode_relay_event(
            r#"{"event":"call-control","data":{"action":"hangup","roomId":"r1"}}"#,
        )
        .unwrap();
        assert_eq!(
            control,
            RelayEvent::CallControl(CallControl {
                action: CallAction::Hangup,
                room_id: "r1".into()
            })
        );
        let quality = decode_relay_event(
            r#"{"event":"connection-quality-update","data":{"quality":"poor"}}"#,
        )
        .unwrap();
        assert_eq!(
            quality,
            RelayEvent::ConnectionQualityUpdate(QualityUpdate {
                quality: ConnectionQuality::Poor
            })
        );
    }

    #[test]
    fn unknown_events_are_distinguished_from_garbage() {
        let chat = decode_relay_event(r#"{"event":"receive-message","data":{"text":"hi"}}"#);
        assert!(matches!(chat, Err(SignalingProtocolError::UnknownEvent(name)) if name == "receive-message"));

        let broken = decode_relay_event(r#"{"event":"offer","data":{"fromSocketId":"a"}}"#);
        assert!(matches!(broken, Err(SignalingProtocolError::Malformed(_))));

        let junk = decode_relay_event("not json");
        assert!(matches!(junk, Err(SignalingProtocolError::Malformed(_))));
    }

    #[test]
    fn members_convert_to_participants() {
        let joined = decode_relay_event(
            r#"{"event":"joined-room","data":{"roomId":"r1","members":[{"socketId":"s1","userId":"bob"}]}}"#,
        )
        .unwrap();
        let RelayEvent::JoinedRoom(joined) = joined else {
            panic!("expected joined-room");
        };
        let participants: Vec<Participant> = joined.members.into_iter().map(Into::into).collect();
        assert_eq!(participants, vec![Participant::new("bob", "s1")]);
    }
}
