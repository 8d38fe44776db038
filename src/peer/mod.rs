pub mod link;
pub mod transport;

pub use link::{LinkState, PeerLink};
pub use transport::{
    MediaTransport, RemoteTrack, RtcTransportFactory, TransportEvent, TransportFactory,
    TransportHealth, TransportStats,
};
