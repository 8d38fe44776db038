use serde::{Deserialize, Serialize};

use crate::types::{Participant, ParticipantMetadata};

/// Wire messages exchanged with the signaling server. JSON text frames,
/// tagged by `message_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    JoinRoom {
        room_id: String,
        metadata: ParticipantMetadata,
    },
    /// Join acknowledgement: the server-assigned peer id plus the roster of
    /// participants already in the room.
    Joined {
        peer_id: String,
        participants: Vec<Participant>,
    },
    PeerJoined {
        peer_id: String,
        metadata: ParticipantMetadata,
    },
    PeerLeft {
        peer_id: String,
    },
    Offer {
        from_peer: String,
        to_peer: String,
        sdp: String,
    },
    Answer {
        from_peer: String,
        to_peer: String,
        sdp: String,
    },
    IceCandidate {
        from_peer: String,
        to_peer: String,
        candidate: String,
    },
    Disconnect,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_are_kebab_case() {
        let msg = SignalingMessage::JoinRoom {
            room_id: "r1".to_string(),
            metadata: ParticipantMetadata::new("Ada", "interviewer"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""message_type":"join-room""#));
        assert!(json.contains(r#""room_id":"r1""#));

        let msg = SignalingMessage::IceCandidate {
            from_peer: "a".to_string(),
            to_peer: "b".to_string(),
            candidate: "candidate:1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""message_type":"ice-candidate""#));
    }

    #[test]
    fn parses_joined_with_roster() {
        let json = r#"{
            "message_type": "joined",
            "peer_id": "p2",
            "participants": [
                {"peer_id": "p1", "metadata": {"name": "Ada", "role": "interviewer"}}
            ]
        }"#;
        let msg: SignalingMessage = serde_json::from_str(json).unwrap();
        match msg {
            SignalingMessage::Joined { peer_id, participants } => {
                assert_eq!(peer_id, "p2");
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].peer_id, "p1");
                assert!(participants[0].metadata.avatar.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
