use std::fmt;
use std::sync::Arc;

use crate::agent::{AgentError, Link};
use crate::signaling::PeerId;

/// A direct path to one peer. Cloning shares the same path.
#[derive(Clone)]
pub struct PeerLink {
    peer: PeerId,
    link: Arc<dyn Link>,
}

impl PeerLink {
    pub(crate) fn new(peer: PeerId, link: Arc<dyn Link>) -> Self {
        Self { peer, link }
    }

    /// For the owner this is the guest's id; for a guest, its own.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize, AgentError> {
        self.link.send(buf).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError> {
        self.link.recv(buf).await
    }

    pub async fn close(&self) -> Result<(), AgentError> {
        self.link.close().await
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink").field("peer", &self.peer).finish()
    }
}
