pub mod channel;
pub mod messages;

pub use channel::{ChannelEvent, SignalingChannel};
pub use messages::SignalingMessage;
