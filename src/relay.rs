//! WebSocket relay between the members of a room

mod messages;
mod registry;
mod server;
mod types;

pub use messages::{ConnectParams, ErrorBody};
pub use registry::RoomRegistry;
pub use server::RelayServer;
pub use types::{ConnectionId, OutboundMessage, Peer, RelayError, RoomId};
