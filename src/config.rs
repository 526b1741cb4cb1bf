//! Server and client settings. Defaults match the protocol's timing.

use std::time::Duration;

use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;

pub const DEFAULT_SIGNALING_PORT: u16 = 3479;
pub const DEFAULT_PATH: &str = "/ws";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Per-room timing, copied into every room the server creates
#[derive(Debug, Clone, Copy)]
pub struct RoomTiming {
    /// Bound on a single write to a member
    pub write_timeout: Duration,
    /// Keepalive period per member
    pub ping_interval: Duration,
}

impl Default for RoomTiming {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(3),
            ping_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Only upgrade requests for this path
    pub path: String,
    /// Time a new connection has to state its intent
    pub initial_message_timeout: Duration,
    /// How long a join waits for the owner to register
    pub ready_timeout: Duration,
    pub room: RoomTiming,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            initial_message_timeout: Duration::from_secs(20),
            ready_timeout: Duration::from_secs(10),
            room: RoomTiming::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full `ws://host:port/path` of the rendezvous service
    pub signaling_url: String,
    /// STUN servers handed to the connectivity agent
    pub stun_urls: Vec<String>,
    /// Owner: wait for the room code
    pub create_room_timeout: Duration,
    /// Guest: wait for the owner's credentials
    pub auth_timeout: Duration,
    /// Both: wait for the direct link
    pub link_timeout: Duration,
    /// Bound on client writes to the signaling socket
    pub write_timeout: Duration,
    /// Transports the agent gathers candidates on
    pub network_types: Vec<NetworkType>,
    /// Host candidates go out as `.local` names and remote ones are resolved
    pub multicast_dns_mode: MulticastDnsMode,
}

impl ClientConfig {
    pub fn new(server_addr: &str, path: &str) -> Self {
        Self {
            signaling_url: format!("ws://{}{}", server_addr, path),
            ..Default::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: format!("ws://127.0.0.1:{}{}", DEFAULT_SIGNALING_PORT, DEFAULT_PATH),
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            create_room_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            link_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            network_types: vec![NetworkType::Udp4, NetworkType::Udp6],
            multicast_dns_mode: MulticastDnsMode::QueryAndGather,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builds_url() {
        let cfg = ClientConfig::new("localhost:9090", "/ws");
        assert_eq!(cfg.signaling_url, "ws://localhost:9090/ws");
        assert_eq!(cfg.create_room_timeout, Duration::from_secs(5));
    }

    #[test]
    fn client_gathers_udp_with_mdns() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.network_types, vec![NetworkType::Udp4, NetworkType::Udp6]);
        assert_eq!(cfg.multicast_dns_mode, MulticastDnsMode::QueryAndGather);
    }

    #[test]
    fn server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.path, "/ws");
        assert_eq!(cfg.initial_message_timeout, Duration::from_secs(20));
        assert_eq!(cfg.room.write_timeout, Duration::from_secs(3));
        assert_eq!(cfg.room.ping_interval, Duration::from_secs(10));
    }
}
