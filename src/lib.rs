#![allow(warnings)]
pub mod config;
pub mod media;
pub mod monitoring;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::RoomConfig;
pub use media::DeviceManager;
pub use room::{MediaSelection, RoomEvent, RoomSession};
pub use types::ParticipantMetadata;
