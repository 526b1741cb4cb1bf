use std::fmt;

use tokio::sync::watch;
use tracing::debug;

/// Client-side handshake progress, in order. `Failed` and `Closed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Connecting,
    CredentialExchange,
    CandidateTrickling,
    AwaitingLink,
    Linked,
    Failed,
    Closed,
}

impl HandshakeState {
    pub fn is_final(self) -> bool {
        matches!(self, HandshakeState::Failed | HandshakeState::Closed)
    }
}

/// Tracks one handshake session. Only moves forward.
pub(crate) struct Handshake {
    label: String,
    state: watch::Sender<HandshakeState>,
}

impl Handshake {
    pub fn new(label: impl fmt::Display) -> Self {
        let (state, _) = watch::channel(HandshakeState::Connecting);
        Self {
            label: label.to_string(),
            state,
        }
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    pub fn advance(&self, next: HandshakeState) {
        let label = &self.label;
        self.state.send_if_modified(|current| {
            if current.is_final() || next <= *current {
                return false;
            }
            debug!("handshake {}: {:?} -> {:?}", label, current, next);
            *current = next;
            true
        });
    }

    pub fn fail(&self) {
        self.advance(HandshakeState::Failed);
    }

    pub fn close(&self) {
        self.advance(HandshakeState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_forward_only() {
        let hs = Handshake::new("test");
        assert_eq!(hs.state(), HandshakeState::Connecting);
        hs.advance(HandshakeState::CandidateTrickling);
        hs.advance(HandshakeState::CredentialExchange);
        assert_eq!(hs.state(), HandshakeState::CandidateTrickling);
        hs.advance(HandshakeState::Linked);
        assert_eq!(hs.state(), HandshakeState::Linked);
    }

    #[test]
    fn final_states_stick() {
        let hs = Handshake::new("test");
        hs.fail();
        hs.close();
        hs.advance(HandshakeState::Linked);
        assert_eq!(hs.state(), HandshakeState::Failed);
    }

    #[test]
    fn linked_session_can_close() {
        let hs = Handshake::new("test");
        hs.advance(HandshakeState::Linked);
        hs.close();
        assert_eq!(hs.state(), HandshakeState::Closed);
    }
}
