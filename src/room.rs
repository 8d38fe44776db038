pub mod session;

pub use session::{MediaSelection, RoomEvent, RoomSession};
