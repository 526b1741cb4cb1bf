//! Owner and guest orchestrators.
//!
//! Both roles talk to the rendezvous server over one WebSocket, swap ICE
//! credentials and candidates through it, and hand the resulting direct
//! path to the caller as a [`PeerLink`]. A failed handshake is returned as a
//! [`HandshakeError`]; nothing is retried here.

mod guest;
mod handshake;
mod link;
mod owner;

pub use guest::Guest;
pub use handshake::HandshakeState;
pub use link::PeerLink;
pub use owner::{OnConnect, Owner};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::agent::AgentError;
use crate::channel::{self, ChannelError, Inbox, Outbox};
use crate::config::ClientConfig;
use crate::signaling::{Envelope, MessageType};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to reach signaling server: {0}")]
    Connect(#[source] WsError),

    #[error("signaling server closed the channel: {0}")]
    Rejected(String),

    #[error(transparent)]
    Channel(ChannelError),

    #[error("timed out waiting for {0:?}")]
    ResponseTimeout(MessageType),

    #[error("timed out waiting for the direct link")]
    LinkTimeout,

    #[error("unexpected {got:?} while waiting for {expected:?}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },

    #[error("unhandled message type {0:?}")]
    Unhandled(MessageType),

    #[error("{0:?} is missing its {1} field")]
    MissingField(MessageType, &'static str),

    #[error("kicked by the room owner")]
    Kicked,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("session closed")]
    Closed,
}

impl From<ChannelError> for HandshakeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed {
                reason: Some(reason),
            } => HandshakeError::Rejected(reason),
            other => HandshakeError::Channel(other),
        }
    }
}

/// Open the signaling socket
async fn connect(config: &ClientConfig) -> Result<(Arc<Outbox>, Inbox), HandshakeError> {
    let (ws, _) = tokio_tungstenite::connect_async(config.signaling_url.as_str())
        .await
        .map_err(HandshakeError::Connect)?;
    let (outbox, inbox) = channel::split(ws);
    Ok((Arc::new(outbox), inbox))
}

/// Wait for one message of type `expected`, skipping keepalive pings.
/// Anything else is a protocol violation.
async fn await_message(
    inbox: &mut Inbox,
    expected: MessageType,
    limit: Duration,
) -> Result<Envelope, HandshakeError> {
    let deadline = Instant::now() + limit;
    loop {
        let msg = tokio::time::timeout_at(deadline, inbox.recv())
            .await
            .map_err(|_| HandshakeError::ResponseTimeout(expected))??;
        match msg.kind {
            MessageType::Ping => continue,
            kind if kind == expected => return Ok(msg),
            got => return Err(HandshakeError::UnexpectedMessage { expected, got }),
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}
