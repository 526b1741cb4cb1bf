//! Peer-to-peer rendezvous: a signaling server that pairs a room owner with
//! its guests, and the client roles that use it to set up direct links.

pub mod agent;
pub mod channel;
pub mod client;
pub mod config;
pub mod signaling;

pub use client::{Guest, HandshakeError, Owner, PeerLink};
pub use config::{ClientConfig, ServerConfig};
pub use signaling::{Envelope, MessageType, PeerId, RoomCode, SignalingServer};
