use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Capture acquisition failed. Recoverable: the caller may retry or
    /// enter the room without that track.
    DeviceUnavailable(String),
    /// The signaling channel could not be established. Fatal to room entry.
    SignalingUnreachable(String),
    /// Description or candidate application failed for one peer link.
    NegotiationFailed(String),
    /// Device switch aborted; the previous device is still active.
    DeviceSwitchFailed(String),
    RecorderNotActive,
    RecorderBusy,
    NoActiveStream,
    SessionClosed,
    Room(String),
    Media(String),
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
    IO(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeviceUnavailable(e) => write!(f, "Device unavailable: {}", e),
            Error::SignalingUnreachable(e) => write!(f, "Signaling unreachable: {}", e),
            Error::NegotiationFailed(e) => write!(f, "Negotiation failed: {}", e),
            Error::DeviceSwitchFailed(e) => write!(f, "Device switch failed: {}", e),
            Error::RecorderNotActive => write!(f, "Recorder is not active"),
            Error::RecorderBusy => write!(f, "Recorder is already running"),
            Error::NoActiveStream => write!(f, "No active local stream"),
            Error::SessionClosed => write!(f, "Room session is closed"),
            Error::Room(e) => write!(f, "Room error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::IO(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

impl From<webrtc::Error> for Error {
    fn from(error: webrtc::Error) -> Self {
        Error::Media(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
