//! Reliable ordered message channel on top of a WebSocket.
//!
//! A socket is split into an [`Outbox`] (shared, serialized writes) and an
//! [`Inbox`] (single reader). Both carry [`Envelope`]s in binary frames.

use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tracing::debug;

use crate::signaling::Envelope;

/// Time allowed for a close frame to go out before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    Transport(#[from] WsError),

    #[error("write timed out")]
    Timeout,

    #[error("channel closed: {}", reason.as_deref().unwrap_or("no reason given"))]
    Closed { reason: Option<String> },

    #[error("non-binary frame received")]
    NonBinary,
}

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameStream = BoxStream<'static, Result<Message, WsError>>;

/// Split a socket into its write and read halves
pub fn split<S>(ws: WebSocketStream<S>) -> (Outbox, Inbox)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        Outbox {
            sink: Mutex::new(Box::pin(sink)),
        },
        Inbox {
            stream: stream.boxed(),
        },
    )
}

/// Write half. Safe to share between tasks; frames go out one at a time.
pub struct Outbox {
    sink: Mutex<FrameSink>,
}

impl Outbox {
    pub async fn send(&self, msg: &Envelope) -> Result<(), ChannelError> {
        let frame = Message::Binary(msg.encode().into());
        self.sink.lock().await.send(frame).await?;
        Ok(())
    }

    /// Like [`send`](Self::send), but waiting for the lock counts against
    /// `limit` too. A timeout is reported as [`ChannelError::Timeout`].
    pub async fn send_within(&self, msg: &Envelope, limit: Duration) -> Result<(), ChannelError> {
        tokio::time::timeout(limit, self.send(msg))
            .await
            .map_err(|_| ChannelError::Timeout)?
    }

    /// Send a close frame. Failures are logged only; the peer may already
    /// be gone.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from(reason.to_string()),
        }));
        let result = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await?;
            sink.close().await
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("close frame not delivered: {}", e),
            Err(_) => debug!("close frame timed out"),
        }
    }
}

/// Read half
pub struct Inbox {
    stream: FrameStream,
}

impl Inbox {
    /// Next envelope from the peer. Control frames are skipped; a text frame
    /// is an error. The envelope may be `Invalid` and must be checked.
    pub async fn recv(&mut self) -> Result<Envelope, ChannelError> {
        loop {
            let frame = match self.stream.next().await {
                Some(frame) => frame?,
                None => return Err(ChannelError::Closed { reason: None }),
            };
            match frame {
                Message::Binary(payload) => return Ok(Envelope::decode(&payload)),
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    return Err(ChannelError::Closed { reason });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Text(_) => return Err(ChannelError::NonBinary),
            }
        }
    }

    /// Like [`recv`](Self::recv), bounded by `limit`
    pub async fn recv_within(&mut self, limit: Duration) -> Result<Envelope, ChannelError> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| ChannelError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MessageType;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> ((Outbox, Inbox), (Outbox, Inbox)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (split(server), split(client))
    }

    #[tokio::test]
    async fn envelopes_arrive_in_order() {
        let ((tx, _), (_, mut rx)) = pair().await;
        tx.send(&Envelope::ping()).await.unwrap();
        tx.send(&Envelope::ice_auth_initiate("u", "p")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, MessageType::Ping);
        assert_eq!(rx.recv().await.unwrap().kind, MessageType::IceAuthInitiate);
    }

    #[tokio::test]
    async fn close_reason_reaches_reader() {
        let ((tx, _), (_, mut rx)) = pair().await;
        tx.close(CloseCode::Normal, "room does not exist").await;

        match rx.recv().await {
            Err(ChannelError::Closed { reason }) => {
                assert_eq!(reason.as_deref(), Some("room does not exist"))
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn recv_within_times_out() {
        let ((_tx, _rx), (_, mut rx)) = pair().await;
        let result = rx.recv_within(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }
}
