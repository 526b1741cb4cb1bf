//! One rendezvous session: membership, relay policy, keepalive and the
//! shutdown cascade.
//!
//! A room has exactly one owner. The owner is the room's authority: when its
//! channel is lost the whole room goes down, closing every guest channel.
//! Guests only ever talk to the owner, and the owner addresses guests by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use super::messages::{Envelope, MessageType};
use super::types::{PeerId, RoomCode, SignalingError};
use crate::channel::{self, Inbox, Outbox};
use crate::config::RoomTiming;

/// Room lifecycle, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoomState {
    AwaitingOwner,
    Ready,
    ShuttingDown,
    Closed,
}

/// A member's signaling channel, as seen by the room
pub struct Connection {
    id: PeerId,
    room_id: RoomCode,
    outbox: Outbox,
}

impl Connection {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn room_id(&self) -> RoomCode {
        self.room_id
    }
}

/// A freshly registered member: the shared connection plus the read half
/// its listen loop consumes.
pub struct Member {
    pub connection: Arc<Connection>,
    inbox: Inbox,
}

impl Member {
    pub fn id(&self) -> PeerId {
        self.connection.id
    }
}

pub struct Room {
    id: RoomCode,
    timing: RoomTiming,
    owner_id: OnceLock<PeerId>,
    /// Held for map access only, never across a channel write
    members: Mutex<HashMap<PeerId, Arc<Connection>>>,
    state: watch::Sender<RoomState>,
}

impl Room {
    pub fn new(id: RoomCode, timing: RoomTiming) -> Self {
        let (state, _) = watch::channel(RoomState::AwaitingOwner);
        Self {
            id,
            timing,
            owner_id: OnceLock::new(),
            members: Mutex::new(HashMap::new()),
            state,
        }
    }

    pub fn id(&self) -> RoomCode {
        self.id
    }

    pub fn owner_id(&self) -> Option<PeerId> {
        self.owner_id.get().copied()
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members().keys().copied().collect()
    }

    pub fn is_member(&self, id: &PeerId) -> bool {
        self.members().contains_key(id)
    }

    fn members(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<Connection>>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection(&self, id: &PeerId) -> Option<Arc<Connection>> {
        self.members().get(id).cloned()
    }

    /// Insert under a fresh id that does not collide with a current member
    fn insert_member(&self, outbox: Outbox) -> Arc<Connection> {
        let mut members = self.members();
        let mut id = PeerId::generate();
        while members.contains_key(&id) {
            id = PeerId::generate();
        }
        let connection = Arc::new(Connection {
            id,
            room_id: self.id,
            outbox,
        });
        members.insert(id, connection.clone());
        connection
    }

    /// Register the room's single owner, answer it with the room code and
    /// open the ready gate. Starts the owner's keepalive.
    pub async fn register_owner<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> Result<Member, SignalingError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, inbox) = channel::split(ws);
        if self.owner_id.get().is_some() {
            outbox.close(CloseCode::Policy, "room already has an owner").await;
            return Err(SignalingError::OwnerAlreadyRegistered(self.id));
        }
        if self.state() >= RoomState::ShuttingDown {
            outbox.close(CloseCode::Away, "room is shutting down").await;
            return Err(SignalingError::RoomShuttingDown(self.id));
        }

        let connection = self.insert_member(outbox);
        if self.owner_id.set(connection.id).is_err() {
            self.members().remove(&connection.id);
            connection.outbox.close(CloseCode::Policy, "room already has an owner").await;
            return Err(SignalingError::OwnerAlreadyRegistered(self.id));
        }
        info!("Room {}: owner {} registered", self.id, connection.id);

        self.write(connection.id, &Envelope::create_room_response(self.id)).await;
        self.state.send_if_modified(|state| {
            if *state == RoomState::AwaitingOwner {
                *state = RoomState::Ready;
                true
            } else {
                false
            }
        });

        self.spawn_keepalive(connection.id);
        Ok(Member { connection, inbox })
    }

    /// Add a guest. Only valid once the ready gate is open.
    pub async fn register_guest<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> Result<Member, SignalingError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, inbox) = channel::split(ws);
        match self.state() {
            RoomState::Ready => {}
            RoomState::AwaitingOwner => {
                outbox.close(CloseCode::Protocol, "room is not ready").await;
                return Err(SignalingError::RoomNotReady(self.id));
            }
            RoomState::ShuttingDown | RoomState::Closed => {
                outbox.close(CloseCode::Away, "room is shutting down").await;
                return Err(SignalingError::RoomShuttingDown(self.id));
            }
        }

        let connection = self.insert_member(outbox);
        info!("Room {}: guest {} joined", self.id, connection.id);
        self.spawn_keepalive(connection.id);
        Ok(Member { connection, inbox })
    }

    /// Wait for the ready gate. Fails if the room shuts down first.
    pub async fn wait_ready(&self) -> Result<(), SignalingError> {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state != RoomState::AwaitingOwner).await {
            Ok(state) if *state == RoomState::Ready => Ok(()),
            _ => Err(SignalingError::RoomShuttingDown(self.id)),
        }
    }

    /// Resolves once the room starts shutting down
    pub async fn shutdown_signal(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state >= RoomState::ShuttingDown).await;
    }

    /// Read loop for one member. Returns when its channel fails or closes,
    /// when the member is removed, or when the room shuts down.
    pub async fn listen(&self, member: Member) {
        let Member { connection, mut inbox } = member;
        let id = connection.id;
        loop {
            let received = tokio::select! {
                _ = self.shutdown_signal() => break,
                received = inbox.recv() => received,
            };
            match received {
                Ok(msg) => {
                    if !self.is_member(&id) {
                        debug!("Room {}: {} is no longer a member, stop listening", self.id, id);
                        break;
                    }
                    self.relay(id, msg).await;
                }
                Err(e) => {
                    debug!("Room {}: read from {} ended: {}", self.id, id, e);
                    break;
                }
            }
        }
    }

    /// Apply the directional forwarding policy to one message from `from`
    pub async fn relay(&self, from: PeerId, mut msg: Envelope) {
        if msg.kind == MessageType::Ping {
            return;
        }
        let Some(owner) = self.owner_id() else {
            debug!("Room {}: dropping {:?}, no owner yet", self.id, msg.kind);
            return;
        };

        if from == owner {
            if msg.kind == MessageType::Kick {
                match msg.to {
                    Some(target) => self.kick(target).await,
                    None => debug!("Room {}: kick without target", self.id),
                }
                return;
            }
            if !msg.kind.owner_to_guest() {
                debug!("Room {}: unallowed message type {:?} sent by owner", self.id, msg.kind);
                return;
            }
            match msg.to {
                Some(target) if target != owner => self.write(target, &msg).await,
                _ => debug!("Room {}: {:?} from owner has no guest target", self.id, msg.kind),
            }
        } else {
            if !msg.kind.guest_to_owner() {
                debug!("Room {}: unallowed message type {:?} sent by guest {}", self.id, msg.kind, from);
                return;
            }
            msg.from = Some(from);
            self.write(owner, &msg).await;
        }
    }

    /// Deliver `msg` to one member within the write timeout. Losing the
    /// owner shuts the room; losing a guest removes it and tells the owner.
    pub async fn write(&self, target: PeerId, msg: &Envelope) {
        let Some(connection) = self.connection(&target) else {
            debug!("Room {}: connection {} not found", self.id, target);
            return;
        };
        let Err(e) = connection.outbox.send_within(msg, self.timing.write_timeout).await else {
            return;
        };

        debug!("Room {}: write to {} failed: {}", self.id, target, e);
        if Some(target) == self.owner_id() {
            warn!("Room {}: owner unreachable, shutting down", self.id);
            self.shutdown().await;
        } else {
            self.drop_guest(target).await;
        }
    }

    /// Remove a guest whose channel failed and tell the owner about it.
    /// Only the call that actually removes the guest sends the notice. A room
    /// that is shutting down closes its guests itself and reports nothing.
    pub async fn drop_guest(&self, id: PeerId) {
        if Some(id) == self.owner_id() || self.state() >= RoomState::ShuttingDown {
            return;
        }
        let Some(connection) = self.members().remove(&id) else {
            return;
        };
        info!("Room {}: guest {} disconnected", self.id, id);
        connection.outbox.close(CloseCode::Away, "unreachable").await;

        let Some(owner) = self.owner_id().and_then(|owner| self.connection(&owner)) else {
            return;
        };
        if let Err(e) = owner
            .outbox
            .send_within(&Envelope::guest_disconnected(id), self.timing.write_timeout)
            .await
        {
            warn!("Room {}: failed to notify owner about {}: {}", self.id, id, e);
        }
    }

    /// Owner-initiated removal. The target gets a kick notice and is expected
    /// to hang up; the room stops relaying for it right away.
    pub async fn kick(&self, target: PeerId) {
        if Some(target) == self.owner_id() {
            debug!("Room {}: owner cannot kick itself", self.id);
            return;
        }
        let Some(connection) = self.members().remove(&target) else {
            debug!("Room {}: kick for unknown member {}", self.id, target);
            return;
        };
        info!("Room {}: guest {} kicked", self.id, target);
        if let Err(e) = connection
            .outbox
            .send_within(&Envelope::kick(target), self.timing.write_timeout)
            .await
        {
            debug!("Room {}: kick notice to {} failed: {}", self.id, target, e);
        }
        connection.outbox.close(CloseCode::Normal, "kicked").await;
    }

    /// Fire the shutdown signal and close every member channel. Idempotent.
    pub async fn shutdown(&self) {
        let first = self.state.send_if_modified(|state| {
            if *state < RoomState::ShuttingDown {
                *state = RoomState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        info!("Room {} shutting down", self.id);

        let connections: Vec<Arc<Connection>> = self.members().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.outbox.close(CloseCode::Away, "room shut down").await;
        }
    }

    /// Final state once the room is gone from the registry
    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(RoomState::Closed);
    }

    fn spawn_keepalive(self: &Arc<Self>, id: PeerId) {
        let room = Arc::clone(self);
        tokio::spawn(async move { room.keepalive(id).await });
    }

    /// Ping one member at a fixed interval until the room shuts down or the
    /// member is gone.
    async fn keepalive(&self, id: PeerId) {
        let period = self.timing.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.shutdown_signal() => return,
                _ = ticker.tick() => {
                    if !self.is_member(&id) {
                        return;
                    }
                    self.write(id, &Envelope::ping()).await;
                }
            }
        }
    }
}
