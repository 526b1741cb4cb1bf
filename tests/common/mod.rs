#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use icelink::agent::{
    AgentError, AgentFactory, ConnectivityAgent, Credentials, Gathered, Link, LinkState, NewAgent,
};
use icelink::channel::{self, Inbox, Outbox};
use icelink::config::{ClientConfig, DEFAULT_PATH, ServerConfig};
use icelink::signaling::{Envelope, MessageType, SignalingServer};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};

/// Start a server on an ephemeral local port
pub async fn start_server(config: ServerConfig) -> (Arc<SignalingServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SignalingServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(&addr.to_string(), DEFAULT_PATH)
}

/// Plain signaling socket, no client logic on top
pub async fn raw_connect(addr: SocketAddr) -> (Outbox, Inbox) {
    let url = format!("ws://{}{}", addr, DEFAULT_PATH);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    channel::split(ws)
}

/// Next envelope that is not a keepalive
pub async fn next_message(inbox: &mut Inbox) -> Envelope {
    loop {
        let msg = inbox.recv_within(Duration::from_secs(2)).await.unwrap();
        if msg.kind != MessageType::Ping {
            return msg;
        }
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

type Meeting = oneshot::Sender<Arc<dyn Link>>;

/// Pairs agents in-process. An `accept` and a `dial` meet when each names
/// the other's credentials.
#[derive(Default)]
struct Switchboard {
    waiting: Mutex<HashMap<(String, String), Meeting>>,
}

impl Switchboard {
    async fn meet(&self, key: (String, String)) -> Result<Arc<dyn Link>, AgentError> {
        let rx = {
            let mut waiting = self.waiting.lock().unwrap();
            match waiting.remove(&key) {
                Some(peer) => {
                    let (ours, theirs) = MockLink::pair();
                    let _ = peer.send(theirs);
                    return Ok(ours);
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    waiting.insert(key, tx);
                    rx
                }
            }
        };
        rx.await.map_err(|_| AgentError::Closed)
    }
}

#[derive(Clone, Copy, Default, PartialEq)]
enum LinkMode {
    #[default]
    Normal,
    /// Dial and accept never find a path
    Unlinkable,
    /// Reports `Connected` but never hands out a link
    Stalled,
}

/// What one agent was fed and how far its link got
struct AgentRecord {
    remote: watch::Receiver<Vec<String>>,
    state: watch::Receiver<LinkState>,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    board: Arc<Switchboard>,
    created: Arc<AtomicUsize>,
    agents: Arc<Mutex<Vec<AgentRecord>>>,
    mode: LinkMode,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for the other side: same switchboard and numbering, but its
    /// agents are recorded separately
    pub fn peer(&self) -> Self {
        Self {
            agents: Arc::default(),
            ..self.clone()
        }
    }

    pub fn unlinkable(&self) -> Self {
        Self {
            mode: LinkMode::Unlinkable,
            ..self.clone()
        }
    }

    pub fn stalled(&self) -> Self {
        Self {
            mode: LinkMode::Stalled,
            ..self.clone()
        }
    }

    /// The one candidate the `n`th agent created gathers
    pub fn candidate(n: usize) -> String {
        format!("candidate:{} 1 udp 1 127.0.0.1 {} typ host", n, 40000 + n)
    }

    /// Remote candidates fed to the agents from this factory
    pub fn remote_candidates(&self) -> Vec<String> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .flat_map(|a| a.remote.borrow().clone())
            .collect()
    }

    pub fn link_states(&self) -> Vec<LinkState> {
        self.agents.lock().unwrap().iter().map(|a| *a.state.borrow()).collect()
    }
}

#[async_trait]
impl AgentFactory for MockFactory {
    async fn create(&self) -> Result<NewAgent, AgentError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let credentials = Credentials::new(format!("ufrag{}", n), format!("pwd{}", n));

        let (candidate_tx, candidates) = mpsc::channel(8);
        candidate_tx
            .send(Gathered::Candidate(Self::candidate(n)))
            .await
            .map_err(|_| AgentError::Closed)?;
        candidate_tx
            .send(Gathered::Complete)
            .await
            .map_err(|_| AgentError::Closed)?;

        let (state_tx, states) = watch::channel(LinkState::New);
        let (remote_tx, remote) = watch::channel(Vec::new());
        self.agents.lock().unwrap().push(AgentRecord {
            remote,
            state: states.clone(),
        });
        let agent = MockAgent {
            local: credentials.clone(),
            board: self.board.clone(),
            mode: self.mode,
            remote: remote_tx,
            state: state_tx,
        };
        Ok(NewAgent {
            agent: Arc::new(agent),
            credentials,
            candidates,
            states,
        })
    }
}

struct MockAgent {
    local: Credentials,
    board: Arc<Switchboard>,
    mode: LinkMode,
    remote: watch::Sender<Vec<String>>,
    state: watch::Sender<LinkState>,
}

impl MockAgent {
    async fn link(&self, key: (String, String)) -> Result<Arc<dyn Link>, AgentError> {
        if self.mode == LinkMode::Unlinkable {
            std::future::pending::<()>().await;
        }
        // no path can be checked before the peer's first candidate
        let mut remote = self.remote.subscribe();
        if remote.wait_for(|c| !c.is_empty()).await.is_err() {
            return Err(AgentError::Closed);
        }
        self.state.send_replace(LinkState::Checking);
        if self.mode == LinkMode::Stalled {
            self.state.send_replace(LinkState::Connected);
            std::future::pending::<()>().await;
        }
        let link = self.board.meet(key).await?;
        self.state.send_replace(LinkState::Connected);
        Ok(link)
    }
}

#[async_trait]
impl ConnectivityAgent for MockAgent {
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), AgentError> {
        if !candidate.starts_with("candidate:") {
            return Err(AgentError::Decode(candidate.to_string()));
        }
        self.remote.send_modify(|c| c.push(candidate.to_string()));
        Ok(())
    }

    async fn dial(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError> {
        self.link((remote.ufrag, self.local.ufrag.clone())).await
    }

    async fn accept(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError> {
        self.link((self.local.ufrag.clone(), remote.ufrag)).await
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.state.send_replace(LinkState::Closed);
        Ok(())
    }
}

struct MockLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl MockLink {
    fn pair() -> (Arc<dyn Link>, Arc<dyn Link>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = MockLink {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            closed: watch::channel(false).0,
        };
        let b = MockLink {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            closed: watch::channel(false).0,
        };
        (Arc::new(a), Arc::new(b))
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send(&self, buf: &[u8]) -> Result<usize, AgentError> {
        if *self.closed.borrow() {
            return Err(AgentError::Closed);
        }
        self.tx.send(buf.to_vec()).map_err(|_| AgentError::Closed)?;
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        let packet = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Err(AgentError::Closed),
            packet = rx.recv() => packet.ok_or(AgentError::Closed)?,
        };
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.closed.send_replace(true);
        Ok(())
    }
}
