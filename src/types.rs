use serde::{Deserialize, Serialize};

/// Display metadata a participant carries into the room. Supplied by the
/// caller at entry; the core never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantMetadata {
    pub name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ParticipantMetadata {
    pub fn new(name: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            avatar: None,
        }
    }
}

/// A remote participant as reported by the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub peer_id: String,
    pub metadata: ParticipantMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Screen,
}

impl DeviceKind {
    pub fn track_kind(&self) -> TrackKind {
        match self {
            DeviceKind::Microphone => TrackKind::Audio,
            DeviceKind::Camera | DeviceKind::Screen => TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which feed currently backs the local video track. Exactly one at a time;
/// switching is a substitution, never an addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Negotiation role of a peer link, fixed at creation by who sent the
/// initial offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

/// A capture device as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}
