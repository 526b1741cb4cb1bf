use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, info, warn};

use super::messages::{Envelope, MessageType};
use super::registry::RoomRegistry;
use super::types::SignalingError;
use crate::config::ServerConfig;

/// How long a rejected socket is drained before it is dropped, so the close
/// frame is read by the peer instead of being lost to a reset
const CLOSE_LINGER: Duration = Duration::from_secs(1);

struct Shared {
    config: ServerConfig,
    registry: RoomRegistry,
    cancel: watch::Sender<bool>,
}

/// Rendezvous server: accepts sockets, reads one initial message and turns
/// the socket into a room owner or guest.
pub struct SignalingServer {
    shared: Arc<Shared>,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl SignalingServer {
    pub fn new(config: ServerConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: RoomRegistry::new(),
                cancel,
            }),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.shared.registry
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener. Returns after
    /// [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            "Signaling server listening on {}{}",
            listener.local_addr()?,
            self.shared.config.path
        );
        let mut cancel = self.shared.cancel.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                accepted = listener.accept() => accepted?,
            };
            let shared = self.shared.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    warn!("Connection from {} ended: {}", addr, e);
                }
            });
        }

        info!("Signaling server stopped accepting");
        Ok(())
    }

    /// Stop accepting and tear down every room. Each room closes its own
    /// member channels; connections still being set up are closed too.
    pub fn shutdown(&self) {
        self.shared.cancel.send_replace(true);
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), SignalingError> {
    let path = shared.config.path.clone();
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    })
    .await?;
    debug!("WebSocket connection from {}", addr);

    let mut cancel = shared.cancel.subscribe();
    let initial = tokio::select! {
        _ = cancelled(&mut cancel) => Err((CloseCode::Away, "server shutting down")),
        initial = read_initial_message(&mut ws, shared.config.initial_message_timeout) => initial,
    };
    let msg = match initial {
        Ok(msg) => msg,
        Err((code, reason)) => {
            debug!("Rejecting {}: {}", addr, reason);
            reject(ws, code, reason).await;
            return Ok(());
        }
    };

    match msg.kind {
        MessageType::CreateRoomRequest => {
            let room = shared.registry.create(shared.config.room);
            let result = async {
                let owner = room.register_owner(ws).await?;
                info!("Room {} owned by {} ({})", room.id(), owner.id(), addr);
                tokio::select! {
                    _ = room.listen(owner) => {}
                    _ = cancelled(&mut cancel) => {}
                }
                Ok::<(), SignalingError>(())
            }
            .await;
            room.shutdown().await;
            shared.registry.remove(&room.id());
            result
        }

        MessageType::JoinRoomRequest => {
            let Some(room) = msg.room_id.and_then(|code| shared.registry.get(&code)) else {
                reject(ws, CloseCode::Normal, "room does not exist").await;
                let code = msg.room_id.map(|c| c.to_string()).unwrap_or_default();
                return Err(SignalingError::RoomNotFound(code));
            };

            let ready = tokio::select! {
                _ = cancelled(&mut cancel) => {
                    reject(ws, CloseCode::Away, "server shutting down").await;
                    return Ok(());
                }
                ready = tokio::time::timeout(shared.config.ready_timeout, room.wait_ready()) => ready,
            };
            match ready {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    reject(ws, CloseCode::Away, "room is shutting down").await;
                    return Err(e);
                }
                Err(_) => {
                    reject(ws, CloseCode::Protocol, "room is not ready").await;
                    return Err(SignalingError::RoomNotReady(room.id()));
                }
            }

            let guest = room.register_guest(ws).await?;
            let id = guest.id();
            info!("Guest {} ({}) in room {}", id, addr, room.id());
            tokio::select! {
                _ = room.listen(guest) => room.drop_guest(id).await,
                // the whole room goes down, not just this guest
                _ = cancelled(&mut cancel) => room.shutdown().await,
            }
            Ok(())
        }

        _ => {
            reject(ws, CloseCode::Protocol, "invalid message type").await;
            Ok(())
        }
    }
}

/// The first data frame decides what the socket is for. Anything but a
/// create or join request gets a close reason back.
async fn read_initial_message(
    ws: &mut WebSocketStream<TcpStream>,
    limit: Duration,
) -> Result<Envelope, (CloseCode, &'static str)> {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(frame)) => return Ok(frame),
                Some(Err(e)) => {
                    debug!("Initial read failed: {}", e);
                    return Err((CloseCode::Normal, "unable to read"));
                }
                None => return Err((CloseCode::Normal, "unable to read")),
            }
        }
    };
    let frame = tokio::time::timeout(limit, read)
        .await
        .map_err(|_| (CloseCode::Normal, "unable to read"))??;

    let Message::Binary(payload) = frame else {
        return Err((CloseCode::Protocol, "incorrect message"));
    };
    let msg = Envelope::decode(&payload);
    if !msg.is_valid() {
        return Err((CloseCode::Protocol, "failed to decode message"));
    }
    match msg.kind {
        MessageType::CreateRoomRequest | MessageType::JoinRoomRequest => Ok(msg),
        _ => Err((CloseCode::Protocol, "invalid message type")),
    }
}

/// Close a socket that never became a member
async fn reject(mut ws: WebSocketStream<TcpStream>, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from(reason.to_string()),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Close frame not delivered: {}", e);
        return;
    }
    let _ = tokio::time::timeout(CLOSE_LINGER, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
