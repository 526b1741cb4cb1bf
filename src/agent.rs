//! Connectivity agent: the negotiation engine that finds a direct path
//! between two endpoints once they have swapped credentials and candidates.
//!
//! The client orchestrators only see the traits here. [`ice`] provides the
//! implementation backed by the `webrtc` ICE agent.

pub mod ice;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Capacity of the queue between candidate discovery and forwarding. A full
/// queue holds up discovery until the forwarder catches up.
pub const CANDIDATE_QUEUE: usize = 50;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("malformed candidate: {0}")]
    Decode(String),

    #[error("invalid agent configuration: {0}")]
    Config(String),

    #[error("ice: {0}")]
    Ice(#[from] webrtc::ice::Error),

    #[error("link: {0}")]
    Link(#[from] webrtc::util::Error),

    #[error("agent closed")]
    Closed,
}

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }
}

/// One item of the local candidate sequence. `Complete` is always the last
/// item; the queue closing without it means the agent went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gathered {
    Candidate(String),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl LinkState {
    /// The link outcome is decided; no more candidates are useful
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Connected
                | LinkState::Completed
                | LinkState::Failed
                | LinkState::Disconnected
                | LinkState::Closed
        )
    }
}

/// A freshly created agent together with its output sequences. The
/// sequences belong to whoever holds this value and cannot be restarted.
pub struct NewAgent {
    pub agent: Arc<dyn ConnectivityAgent>,
    pub credentials: Credentials,
    pub candidates: mpsc::Receiver<Gathered>,
    pub states: watch::Receiver<LinkState>,
}

#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Create an agent and start gathering local candidates
    async fn create(&self) -> Result<NewAgent, AgentError>;
}

#[async_trait]
pub trait ConnectivityAgent: Send + Sync {
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), AgentError>;

    /// Controlling side. Resolves on the first working path.
    async fn dial(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError>;

    /// Controlled side. Resolves on the first working path.
    async fn accept(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError>;

    async fn close(&self) -> Result<(), AgentError>;
}

/// The established direct path
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<usize, AgentError>;

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError>;

    async fn close(&self) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!LinkState::New.is_terminal());
        assert!(!LinkState::Checking.is_terminal());
        assert!(LinkState::Connected.is_terminal());
        assert!(LinkState::Completed.is_terminal());
        assert!(LinkState::Failed.is_terminal());
        assert!(LinkState::Disconnected.is_terminal());
        assert!(LinkState::Closed.is_terminal());
    }
}
