use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use super::handshake::{Handshake, HandshakeState};
use super::link::PeerLink;
use super::{HandshakeError, await_message, connect, stopped};
use crate::agent::{AgentFactory, ConnectivityAgent, Credentials, Gathered, NewAgent};
use crate::channel::{Inbox, Outbox};
use crate::config::ClientConfig;
use crate::signaling::{Envelope, MessageType, PeerId, RoomCode};

/// Called once per guest when its direct link is up. Runs on the task that
/// established the link, so it should hand the link off rather than block.
pub type OnConnect = Arc<dyn Fn(PeerLink) + Send + Sync>;

struct GuestSession {
    agent: Arc<dyn ConnectivityAgent>,
    handshake: Handshake,
}

struct Shared {
    config: ClientConfig,
    outbox: Arc<Outbox>,
    factory: Arc<dyn AgentFactory>,
    on_connect: OnConnect,
    sessions: Mutex<HashMap<PeerId, Arc<GuestSession>>>,
    stop: watch::Sender<bool>,
}

/// Room owner. Holds the room open on the server and accepts a direct link
/// from every guest that asks for one.
pub struct Owner {
    room_id: RoomCode,
    shared: Arc<Shared>,
    events: Mutex<Option<JoinHandle<Result<(), HandshakeError>>>>,
}

impl Owner {
    /// Register a new room and start answering guests in the background
    pub async fn create(
        config: ClientConfig,
        factory: Arc<dyn AgentFactory>,
        on_connect: OnConnect,
    ) -> Result<Owner, HandshakeError> {
        let (outbox, mut inbox) = connect(&config).await?;

        let response = async {
            outbox
                .send_within(&Envelope::create_room_request(), config.write_timeout)
                .await?;
            let msg = await_message(
                &mut inbox,
                MessageType::CreateRoomResponse,
                config.create_room_timeout,
            )
            .await?;
            msg.room_id.ok_or(HandshakeError::MissingField(
                MessageType::CreateRoomResponse,
                "room_id",
            ))
        }
        .await;
        let room_id = match response {
            Ok(room_id) => room_id,
            Err(e) => {
                outbox.close(CloseCode::Protocol, "room was not created").await;
                return Err(e);
            }
        };
        info!("Owner registered room {}", room_id);

        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            outbox,
            factory,
            on_connect,
            sessions: Mutex::new(HashMap::new()),
            stop,
        });
        let events = tokio::spawn(shared.clone().run(inbox));

        Ok(Owner {
            room_id,
            shared,
            events: Mutex::new(Some(events)),
        })
    }

    pub fn room_id(&self) -> RoomCode {
        self.room_id
    }

    /// Guests with a handshake in progress or a link up
    pub fn guests(&self) -> Vec<PeerId> {
        self.shared.lock_sessions().keys().copied().collect()
    }

    pub fn session_state(&self, guest: &PeerId) -> Option<HandshakeState> {
        self.shared
            .lock_sessions()
            .get(guest)
            .map(|s| s.handshake.state())
    }

    /// Ask the server to remove `guest` and drop its agent
    pub async fn kick(&self, guest: PeerId) -> Result<(), HandshakeError> {
        self.shared
            .outbox
            .send_within(&Envelope::kick(guest), self.shared.config.write_timeout)
            .await?;
        self.shared.end_session(guest).await;
        Ok(())
    }

    /// Close the room. Every guest agent is shut down.
    pub async fn close(&self) -> Result<(), HandshakeError> {
        self.shared.stop.send_replace(true);
        self.shared.outbox.close(CloseCode::Away, "room closed").await;
        self.closed().await
    }

    /// Wait for the signaling session to end. The error is whatever ended
    /// it; a second call returns `Ok`.
    pub async fn closed(&self) -> Result<(), HandshakeError> {
        let handle = match self.events.lock() {
            Ok(mut events) => events.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => handle.await.map_err(|_| HandshakeError::Closed)?,
            None => Ok(()),
        }
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
    }
}

impl Shared {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<GuestSession>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn session(&self, guest: &PeerId) -> Option<Arc<GuestSession>> {
        self.lock_sessions().get(guest).cloned()
    }

    async fn run(self: Arc<Self>, mut inbox: Inbox) -> Result<(), HandshakeError> {
        let mut stop = self.stop.subscribe();
        let result = loop {
            let msg = tokio::select! {
                _ = stopped(&mut stop) => break Ok(()),
                msg = inbox.recv() => msg,
            };
            let handled = match msg {
                Ok(msg) => self.handle(msg).await,
                // the server answering our own close
                Err(_) if *stop.borrow() => break Ok(()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            warn!("Owner signaling session ended: {}", e);
        }
        self.stop.send_replace(true);
        let sessions: Vec<_> = self.lock_sessions().drain().collect();
        for (guest, session) in sessions {
            session.handshake.close();
            if let Err(e) = session.agent.close().await {
                debug!("Closing agent for {}: {}", guest, e);
            }
        }
        result
    }

    async fn handle(self: &Arc<Self>, msg: Envelope) -> Result<(), HandshakeError> {
        match msg.kind {
            MessageType::IceAuthInitiate => {
                let Some(guest) = msg.from else {
                    debug!("IceAuthInitiate without sender");
                    return Ok(());
                };
                self.start_session(guest, Credentials::new(msg.ufrag, msg.pwd))
                    .await;
                Ok(())
            }
            MessageType::IceCandidateForOwner => {
                let Some(session) = msg.from.and_then(|guest| self.session(&guest)) else {
                    debug!("Candidate from unknown guest {:?}", msg.from);
                    return Ok(());
                };
                if let Err(e) = session.agent.add_remote_candidate(&msg.candidate).await {
                    debug!("Dropping candidate from {:?}: {}", msg.from, e);
                }
                Ok(())
            }
            MessageType::GuestDisconnected => {
                if let Some(guest) = msg.from {
                    info!("Guest {} left room", guest);
                    self.end_session(guest).await;
                }
                Ok(())
            }
            MessageType::IceCandidatesEnd | MessageType::Ping => Ok(()),
            other => Err(HandshakeError::Unhandled(other)),
        }
    }

    /// Answer one guest: new agent, send our credentials, then accept the
    /// link while our candidates trickle out.
    async fn start_session(self: &Arc<Self>, guest: PeerId, remote: Credentials) {
        let NewAgent {
            agent,
            credentials,
            candidates,
            ..
        } = match self.factory.create().await {
            Ok(created) => created,
            Err(e) => {
                warn!("No agent for guest {}: {}", guest, e);
                return;
            }
        };

        let session = Arc::new(GuestSession {
            agent,
            handshake: Handshake::new(guest),
        });
        let previous = self.lock_sessions().insert(guest, session.clone());
        if let Some(previous) = previous {
            debug!("Guest {} restarted its handshake", guest);
            previous.handshake.close();
            if let Err(e) = previous.agent.close().await {
                debug!("Closing agent for {}: {}", guest, e);
            }
        }
        session.handshake.advance(HandshakeState::CredentialExchange);

        let response = Envelope::ice_auth_response(credentials.ufrag, credentials.pwd, guest);
        if let Err(e) = self
            .outbox
            .send_within(&response, self.config.write_timeout)
            .await
        {
            warn!("Failed to answer guest {}: {}", guest, e);
            self.fail_session(guest, &session).await;
            return;
        }
        session.handshake.advance(HandshakeState::CandidateTrickling);

        tokio::spawn(self.clone().forward_candidates(guest, candidates));
        tokio::spawn(self.clone().accept(guest, session, remote));
    }

    async fn accept(self: Arc<Self>, guest: PeerId, session: Arc<GuestSession>, remote: Credentials) {
        session.handshake.advance(HandshakeState::AwaitingLink);
        let mut stop = self.stop.subscribe();
        let accepted = tokio::select! {
            _ = stopped(&mut stop) => return,
            accepted = tokio::time::timeout(self.config.link_timeout, session.agent.accept(remote)) => accepted,
        };

        match accepted {
            Ok(Ok(link)) => {
                session.handshake.advance(HandshakeState::Linked);
                info!("Direct link up with guest {}", guest);
                (self.on_connect)(PeerLink::new(guest, link));
            }
            Ok(Err(e)) => {
                warn!("Link with guest {} failed: {}", guest, e);
                self.fail_session(guest, &session).await;
            }
            Err(_) => {
                warn!("Link with guest {} timed out", guest);
                self.fail_session(guest, &session).await;
            }
        }
    }

    async fn forward_candidates(self: Arc<Self>, guest: PeerId, mut candidates: mpsc::Receiver<Gathered>) {
        let mut stop = self.stop.subscribe();
        loop {
            let gathered = tokio::select! {
                _ = stopped(&mut stop) => return,
                gathered = candidates.recv() => gathered,
            };
            let msg = match gathered {
                Some(Gathered::Candidate(c)) => Envelope::ice_candidate_for_guest(c, guest),
                Some(Gathered::Complete) => Envelope::ice_candidates_end(Some(guest)),
                None => return,
            };
            if let Err(e) = self.outbox.send_within(&msg, self.config.write_timeout).await {
                debug!("Stopped forwarding candidates to {}: {}", guest, e);
                return;
            }
            if msg.kind == MessageType::IceCandidatesEnd {
                return;
            }
        }
    }

    /// Remove the guest only if `session` is still its current one
    async fn fail_session(&self, guest: PeerId, session: &Arc<GuestSession>) {
        session.handshake.fail();
        {
            let mut sessions = self.lock_sessions();
            if sessions.get(&guest).is_some_and(|s| Arc::ptr_eq(s, session)) {
                sessions.remove(&guest);
            }
        }
        if let Err(e) = session.agent.close().await {
            debug!("Closing agent for {}: {}", guest, e);
        }
    }

    async fn end_session(&self, guest: PeerId) {
        let removed = self.lock_sessions().remove(&guest);
        if let Some(session) = removed {
            session.handshake.close();
            if let Err(e) = session.agent.close().await {
                debug!("Closing agent for {}: {}", guest, e);
            }
        }
    }
}
