//! WebSocket rendezvous server: rooms, membership and message relay

mod messages;
mod registry;
mod room;
mod server;
mod types;

pub use messages::{Envelope, MessageType};
pub use registry::RoomRegistry;
pub use room::{Connection, Member, Room, RoomState};
pub use server::SignalingServer;
pub use types::{PeerId, ROOM_CODE_LEN, RoomCode, SignalingError};
