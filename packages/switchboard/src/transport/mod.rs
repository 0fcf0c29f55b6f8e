//! Transport adapters over the shared dispatch pipeline.

pub mod bus;
pub mod duplex;
pub mod http;

pub use bus::{BusEnvelope, BusError, BusNode, BusSubscription, ClusterBus, MemoryBus, NatsBus, BROADCAST};
pub use duplex::{
    memory_socket_pair, Connection, DuplexClient, DuplexServer, FrameSocket, MemorySocket, Peer,
    PeerEvent, SocketConnector, DISCONNECT, REPEAT_SOCKET_ID,
};
pub use http::HttpTransport;
