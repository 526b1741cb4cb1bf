use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use super::handshake::{Handshake, HandshakeState};
use super::link::PeerLink;
use super::{HandshakeError, await_message, connect, stopped};
use crate::agent::{
    AgentFactory, ConnectivityAgent, Credentials, Gathered, Link, LinkState, NewAgent,
};
use crate::channel::{Inbox, Outbox};
use crate::config::ClientConfig;
use crate::signaling::{Envelope, MessageType, PeerId, RoomCode};

/// A guest with its direct link to the room owner up
pub struct Guest {
    id: PeerId,
    room_id: RoomCode,
    link: PeerLink,
    agent: Arc<dyn ConnectivityAgent>,
    outbox: Arc<Outbox>,
    handshake: Arc<Handshake>,
    stop: watch::Sender<bool>,
}

impl Guest {
    /// Join `room_id` and dial its owner. Either returns a linked guest or
    /// an error with everything already torn down.
    pub async fn join(
        config: &ClientConfig,
        factory: &dyn AgentFactory,
        room_id: RoomCode,
    ) -> Result<Guest, HandshakeError> {
        let handshake = Arc::new(Handshake::new(room_id));
        let (outbox, inbox) = connect(config).await?;

        let created = match factory.create().await {
            Ok(created) => created,
            Err(e) => {
                handshake.fail();
                outbox.close(CloseCode::Normal, "no connectivity agent").await;
                return Err(e.into());
            }
        };
        let agent = created.agent.clone();
        let (stop, _) = watch::channel(false);

        match negotiate(config, room_id, created, &outbox, inbox, &handshake, &stop).await {
            Ok((id, link, inbox)) => {
                handshake.advance(HandshakeState::Linked);
                info!("Guest {} linked to owner of room {}", id, room_id);
                let link = PeerLink::new(id, link);
                tokio::spawn(watch_session(
                    inbox,
                    link.clone(),
                    agent.clone(),
                    handshake.clone(),
                    stop.subscribe(),
                ));
                Ok(Guest {
                    id,
                    room_id,
                    link,
                    agent,
                    outbox,
                    handshake,
                    stop,
                })
            }
            Err(e) => {
                warn!("Joining room {} failed: {}", room_id, e);
                handshake.fail();
                stop.send_replace(true);
                if let Err(e) = agent.close().await {
                    debug!("Closing agent: {}", e);
                }
                outbox.close(CloseCode::Normal, "handshake failed").await;
                Err(e)
            }
        }
    }

    /// Id the server assigned to this guest
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn room_id(&self) -> RoomCode {
        self.room_id
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Leave the room and close the direct link
    pub async fn close(&self) {
        self.stop.send_replace(true);
        self.handshake.close();
        if let Err(e) = self.link.close().await {
            debug!("Closing link: {}", e);
        }
        if let Err(e) = self.agent.close().await {
            debug!("Closing agent: {}", e);
        }
        self.outbox.close(CloseCode::Normal, "guest left").await;
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Credential exchange, then candidates both ways while dialing. Hands the
/// inbox back once the link is decided.
async fn negotiate(
    config: &ClientConfig,
    room_id: RoomCode,
    created: NewAgent,
    outbox: &Arc<Outbox>,
    mut inbox: Inbox,
    handshake: &Handshake,
    stop: &watch::Sender<bool>,
) -> Result<(PeerId, Arc<dyn Link>, Inbox), HandshakeError> {
    let NewAgent {
        agent,
        credentials,
        candidates,
        states,
    } = created;

    handshake.advance(HandshakeState::CredentialExchange);
    outbox
        .send_within(&Envelope::join_room_request(room_id), config.write_timeout)
        .await?;
    outbox
        .send_within(
            &Envelope::ice_auth_initiate(credentials.ufrag, credentials.pwd),
            config.write_timeout,
        )
        .await?;

    let response = await_message(&mut inbox, MessageType::IceAuthResponse, config.auth_timeout).await?;
    let id = response
        .to
        .ok_or(HandshakeError::MissingField(MessageType::IceAuthResponse, "to"))?;
    let remote = Credentials::new(response.ufrag, response.pwd);
    debug!("Room {} assigned guest id {}", room_id, id);

    handshake.advance(HandshakeState::CandidateTrickling);
    tokio::spawn(forward_candidates(
        outbox.clone(),
        candidates,
        config.write_timeout,
        stop.subscribe(),
    ));

    let (decided, decided_rx) = watch::channel(false);
    let mut listener: JoinHandle<Result<Inbox, HandshakeError>> = tokio::spawn(listen_candidates(
        inbox,
        agent.clone(),
        outbox.clone(),
        states,
        decided_rx,
    ));

    handshake.advance(HandshakeState::AwaitingLink);
    let dial = tokio::time::timeout(config.link_timeout, agent.dial(remote));
    tokio::pin!(dial);

    let (dialed, inbox) = tokio::select! {
        dialed = &mut dial => {
            decided.send_replace(true);
            (dialed, join_listener(listener).await)
        }
        listened = &mut listener => {
            // candidate listening only ends early on a decided link state
            // or a signaling failure
            let inbox = flatten(listened)?;
            (dial.await, Ok(inbox))
        }
    };

    let link = dialed.map_err(|_| HandshakeError::LinkTimeout)??;
    match inbox {
        Ok(inbox) => Ok((id, link, inbox)),
        Err(e) => {
            if let Err(e) = link.close().await {
                debug!("Closing link: {}", e);
            }
            Err(e)
        }
    }
}

async fn join_listener(
    listener: JoinHandle<Result<Inbox, HandshakeError>>,
) -> Result<Inbox, HandshakeError> {
    flatten(listener.await)
}

fn flatten(
    joined: Result<Result<Inbox, HandshakeError>, tokio::task::JoinError>,
) -> Result<Inbox, HandshakeError> {
    joined.map_err(|_| HandshakeError::Closed)?
}

/// Feed the owner's candidates into the agent until the link outcome is
/// known. Returns the inbox so the session can keep reading.
async fn listen_candidates(
    mut inbox: Inbox,
    agent: Arc<dyn ConnectivityAgent>,
    outbox: Arc<Outbox>,
    mut states: watch::Receiver<LinkState>,
    mut decided: watch::Receiver<bool>,
) -> Result<Inbox, HandshakeError> {
    loop {
        let msg = tokio::select! {
            state = states.wait_for(|s| s.is_terminal()) => {
                let state = state.map(|s| *s).unwrap_or(LinkState::Closed);
                debug!("Link state {:?}, no longer listening for candidates", state);
                return Ok(inbox);
            }
            _ = decided.wait_for(|d| *d) => return Ok(inbox),
            msg = inbox.recv() => msg?,
        };

        match msg.kind {
            MessageType::IceCandidateForGuest => {
                if let Err(e) = agent.add_remote_candidate(&msg.candidate).await {
                    outbox
                        .close(CloseCode::Protocol, "invalid ice candidate received")
                        .await;
                    return Err(e.into());
                }
            }
            MessageType::IceCandidatesEnd => debug!("Owner finished sending candidates"),
            MessageType::Ping => {}
            MessageType::Kick => return Err(HandshakeError::Kicked),
            got => {
                outbox
                    .close(CloseCode::Protocol, "expected an ice candidate")
                    .await;
                return Err(HandshakeError::UnexpectedMessage {
                    expected: MessageType::IceCandidateForGuest,
                    got,
                });
            }
        }
    }
}

async fn forward_candidates(
    outbox: Arc<Outbox>,
    mut candidates: mpsc::Receiver<Gathered>,
    write_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let gathered = tokio::select! {
            _ = stopped(&mut stop) => return,
            gathered = candidates.recv() => gathered,
        };
        let msg = match gathered {
            Some(Gathered::Candidate(c)) => Envelope::ice_candidate_for_owner(c),
            Some(Gathered::Complete) => Envelope::ice_candidates_end(None),
            None => return,
        };
        if let Err(e) = outbox.send_within(&msg, write_timeout).await {
            debug!("Stopped forwarding candidates: {}", e);
            return;
        }
        if msg.kind == MessageType::IceCandidatesEnd {
            return;
        }
    }
}

/// Keep reading the signaling socket after linking. A kick from the owner
/// or the room going away closes the link.
async fn watch_session(
    mut inbox: Inbox,
    link: PeerLink,
    agent: Arc<dyn ConnectivityAgent>,
    handshake: Arc<Handshake>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = stopped(&mut stop) => return,
            msg = inbox.recv() => msg,
        };
        match msg {
            Ok(msg) if msg.kind == MessageType::Kick => {
                info!("Kicked from room");
                break;
            }
            Ok(msg) => debug!("Ignoring {:?} after link", msg.kind),
            Err(e) => {
                info!("Signaling session ended: {}", e);
                break;
            }
        }
    }

    handshake.close();
    if let Err(e) = link.close().await {
        debug!("Closing link: {}", e);
    }
    if let Err(e) = agent.close().await {
        debug!("Closing agent: {}", e);
    }
}
