use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("room {0} is not ready")]
    RoomNotReady(RoomCode),

    #[error("room {0} is shutting down")]
    RoomShuttingDown(RoomCode),

    #[error("room {0} already has an owner")]
    OwnerAlreadyRegistered(RoomCode),

    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),

    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
pub const ROOM_CODE_LEN: usize = 6;
const PEER_ID_PREFIX: &[u8] = b"peer_";
const PEER_ID_LEN: usize = 13;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room code: 6 characters of base32, easy to read out loud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomCode {
    bytes: [u8; ROOM_CODE_LEN],
}

impl RoomCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; ROOM_CODE_LEN];
        for byte in &mut bytes {
            *byte = ROOM_CODE_CHARS[rng.random_range(0..ROOM_CODE_CHARS.len())];
        }
        Self { bytes }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomCode {
    type Err = SignalingError;

    /// Accepts exactly six ASCII alphanumerics. Lowercase input is folded so
    /// codes typed by hand still resolve.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let src = s.as_bytes();
        if src.len() != ROOM_CODE_LEN || !src.iter().all(u8::is_ascii_alphanumeric) {
            return Err(SignalingError::InvalidRoomCode(s.to_string()));
        }
        let mut bytes = [0u8; ROOM_CODE_LEN];
        for (dst, b) in bytes.iter_mut().zip(src) {
            *dst = b.to_ascii_uppercase();
        }
        Ok(Self { bytes })
    }
}

impl Serialize for RoomCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Peer ID: 13-byte fixed array ("peer_" + 8 hex), unique within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    bytes: [u8; PEER_ID_LEN],
}

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u32 = rng.random();

        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            bytes[5 + i] = HEX_CHARS[nibble];
        }
        Self { bytes }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerId {
    type Err = SignalingError;

    /// Accepts only the generated form. Anything longer, shorter or with a
    /// foreign suffix is not a peer id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let src = s.as_bytes();
        let valid = src.len() == PEER_ID_LEN
            && src.starts_with(PEER_ID_PREFIX)
            && src[PEER_ID_PREFIX.len()..].iter().all(|b| HEX_CHARS.contains(b));
        if !valid {
            return Err(SignalingError::InvalidPeerId(s.to_string()));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(src);
        Ok(Self { bytes })
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
