//! Protocol envelope shared by the rendezvous server and its clients.
//!
//! Every frame on the signaling socket is one [`Envelope`], serialized as a
//! JSON document inside a binary WebSocket frame. Fields that are unset are
//! left out on the wire and come back as their zero value.

use serde::{Deserialize, Serialize};

use super::types::{PeerId, RoomCode};

/// Closed set of envelope types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Decode sentinel. Never written to the wire and never acted upon.
    #[default]
    #[serde(skip)]
    Invalid,
    Ping,
    CreateRoomRequest,
    CreateRoomResponse,
    JoinRoomRequest,
    IceCandidateForOwner,
    IceCandidateForGuest,
    IceAuthInitiate,
    IceAuthResponse,
    IceCandidatesEnd,
    GuestDisconnected,
    Kick,
}

impl MessageType {
    /// Types the relay forwards from the owner to the guest named in `to`
    pub fn owner_to_guest(self) -> bool {
        matches!(
            self,
            MessageType::IceAuthResponse
                | MessageType::IceCandidateForGuest
                | MessageType::IceCandidatesEnd
        )
    }

    /// Types the relay forwards from a guest to the owner
    pub fn guest_to_owner(self) -> bool {
        matches!(
            self,
            MessageType::IceAuthInitiate
                | MessageType::IceCandidateForOwner
                | MessageType::IceCandidatesEnd
        )
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Flat protocol envelope. Which fields matter depends on `kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "is_false")]
    pub success: bool,

    /// Why `success` is false
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cause: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomCode>,

    /// Stamped by the relay on guest traffic, never trusted from a guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ufrag: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pwd: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub candidate: String,
}

impl Envelope {
    fn of(kind: MessageType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn invalid() -> Self {
        Self::of(MessageType::Invalid)
    }

    pub fn ping() -> Self {
        Self::of(MessageType::Ping)
    }

    pub fn create_room_request() -> Self {
        Self::of(MessageType::CreateRoomRequest)
    }

    pub fn create_room_response(room_id: RoomCode) -> Self {
        Self {
            room_id: Some(room_id),
            success: true,
            ..Self::of(MessageType::CreateRoomResponse)
        }
    }

    pub fn join_room_request(room_id: RoomCode) -> Self {
        Self {
            room_id: Some(room_id),
            ..Self::of(MessageType::JoinRoomRequest)
        }
    }

    /// Guest opens the credential exchange
    pub fn ice_auth_initiate(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
            ..Self::of(MessageType::IceAuthInitiate)
        }
    }

    /// Owner answers a guest with its own credentials
    pub fn ice_auth_response(ufrag: impl Into<String>, pwd: impl Into<String>, to: PeerId) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
            to: Some(to),
            ..Self::of(MessageType::IceAuthResponse)
        }
    }

    pub fn ice_candidate_for_owner(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Self::of(MessageType::IceCandidateForOwner)
        }
    }

    pub fn ice_candidate_for_guest(candidate: impl Into<String>, to: PeerId) -> Self {
        Self {
            candidate: candidate.into(),
            to: Some(to),
            ..Self::of(MessageType::IceCandidateForGuest)
        }
    }

    /// End of trickling. `to` is set when the owner sends it.
    pub fn ice_candidates_end(to: Option<PeerId>) -> Self {
        Self {
            to,
            ..Self::of(MessageType::IceCandidatesEnd)
        }
    }

    pub fn guest_disconnected(guest: PeerId) -> Self {
        Self {
            from: Some(guest),
            ..Self::of(MessageType::GuestDisconnected)
        }
    }

    pub fn kick(target: PeerId) -> Self {
        Self {
            to: Some(target),
            ..Self::of(MessageType::Kick)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != MessageType::Invalid
    }

    /// Serialize for the wire.
    ///
    /// Panics on `Invalid`, which has no wire form. Every other envelope is
    /// plain strings and ids, so serialization cannot fail.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope serialization should never fail")
    }

    /// Soft-fail decode: malformed input yields an `Invalid` envelope.
    pub fn decode(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|_| Self::invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomCode {
        "AB12CD".parse().unwrap()
    }

    #[test]
    fn unset_fields_are_omitted() {
        let json = String::from_utf8(Envelope::ping().encode()).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn create_room_response_carries_room_id() {
        let decoded = Envelope::decode(&Envelope::create_room_response(room()).encode());
        assert_eq!(decoded.kind, MessageType::CreateRoomResponse);
        assert_eq!(decoded.room_id, Some(room()));
        assert!(decoded.success);
    }

    #[test]
    fn auth_response_keeps_credentials_and_target() {
        let guest = "peer_0000beef".parse::<PeerId>().unwrap();
        let msg = Envelope::ice_auth_response("u2", "p2", guest);
        let decoded = Envelope::decode(&msg.encode());
        assert_eq!(decoded, msg);
        assert_eq!(decoded.to, Some(guest));
        assert_eq!(decoded.ufrag, "u2");
        assert_eq!(decoded.pwd, "p2");
    }

    #[test]
    fn every_wire_type_survives_encoding() {
        let peer = "peer_12345678".parse::<PeerId>().unwrap();
        let messages = [
            Envelope::ping(),
            Envelope::create_room_request(),
            Envelope::create_room_response(room()),
            Envelope::join_room_request(room()),
            Envelope::ice_auth_initiate("u1", "p1"),
            Envelope::ice_auth_response("u2", "p2", peer),
            Envelope::ice_candidate_for_owner("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host"),
            Envelope::ice_candidate_for_guest("candidate:2 1 udp 1694498815 1.2.3.4 6000 typ srflx", peer),
            Envelope::ice_candidates_end(Some(peer)),
            Envelope::ice_candidates_end(None),
            Envelope::guest_disconnected(peer),
            Envelope::kick(peer),
        ];
        for msg in messages {
            assert_eq!(Envelope::decode(&msg.encode()), msg, "{:?}", msg.kind);
        }
    }

    #[test]
    fn missing_fields_default_to_zero_values() {
        let decoded = Envelope::decode(br#"{"type":"ice_auth_initiate"}"#);
        assert_eq!(decoded.kind, MessageType::IceAuthInitiate);
        assert!(decoded.ufrag.is_empty());
        assert_eq!(decoded.from, None);
        assert!(!decoded.success);
    }

    #[test]
    fn truncated_payload_is_invalid() {
        let bytes = Envelope::ice_auth_initiate("u1", "p1").encode();
        let decoded = Envelope::decode(&bytes[..bytes.len() / 2]);
        assert_eq!(decoded.kind, MessageType::Invalid);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn garbage_and_unknown_types_are_invalid() {
        assert!(!Envelope::decode(b"").is_valid());
        assert!(!Envelope::decode(&[0xff, 0x00, 0x13]).is_valid());
        assert!(!Envelope::decode(br#"{"type":"launch_missiles"}"#).is_valid());
        assert!(!Envelope::decode(br#"{"type":"invalid"}"#).is_valid());
        assert!(!Envelope::decode(br#"{"room_id":"AB12CD"}"#).is_valid());
    }

    #[test]
    fn malformed_room_code_is_invalid() {
        let decoded = Envelope::decode(br#"{"type":"join_room_request","room_id":"nope"}"#);
        assert_eq!(decoded.kind, MessageType::Invalid);
    }

    #[test]
    fn overlong_peer_id_is_invalid() {
        let decoded = Envelope::decode(
            br#"{"type":"ice_candidate_for_guest","to":"peer_12345678ffff","candidate":"candidate:1"}"#,
        );
        assert!(!decoded.is_valid());
    }

    #[test]
    fn relay_allow_lists() {
        assert!(MessageType::IceAuthResponse.owner_to_guest());
        assert!(MessageType::IceCandidatesEnd.owner_to_guest());
        assert!(!MessageType::JoinRoomRequest.owner_to_guest());
        assert!(!MessageType::IceAuthInitiate.owner_to_guest());

        assert!(MessageType::IceAuthInitiate.guest_to_owner());
        assert!(MessageType::IceCandidateForOwner.guest_to_owner());
        assert!(!MessageType::IceCandidateForGuest.guest_to_owner());
        assert!(!MessageType::Kick.guest_to_owner());
        assert!(!MessageType::Invalid.guest_to_owner());
    }
}
