use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use webrtc::ice::agent::Agent;
use webrtc::ice::agent::agent_config::AgentConfig;
use webrtc::ice::candidate::Candidate;
use webrtc::ice::candidate::candidate_base::unmarshal_candidate;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::state::ConnectionState;
use webrtc::ice::url::Url;
use webrtc::util::Conn;

use super::{
    AgentError, AgentFactory, CANDIDATE_QUEUE, ConnectivityAgent, Credentials, Gathered, Link,
    LinkState, NewAgent,
};
use crate::config::ClientConfig;

impl From<ConnectionState> for LinkState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Unspecified | ConnectionState::New => LinkState::New,
            ConnectionState::Checking => LinkState::Checking,
            ConnectionState::Connected => LinkState::Connected,
            ConnectionState::Completed => LinkState::Completed,
            ConnectionState::Failed => LinkState::Failed,
            ConnectionState::Disconnected => LinkState::Disconnected,
            ConnectionState::Closed => LinkState::Closed,
        }
    }
}

/// Creates ICE agents using the configured STUN servers, transports and
/// mDNS mode
#[derive(Clone)]
pub struct IceAgentFactory {
    urls: Vec<Url>,
    network_types: Vec<NetworkType>,
    multicast_dns_mode: MulticastDnsMode,
}

impl IceAgentFactory {
    pub fn new(
        stun_urls: &[String],
        network_types: Vec<NetworkType>,
        multicast_dns_mode: MulticastDnsMode,
    ) -> Result<Self, AgentError> {
        if network_types.is_empty() {
            return Err(AgentError::Config("no network types to gather on".to_string()));
        }
        let urls = stun_urls
            .iter()
            .map(|raw| Url::parse_url(raw).map_err(|e| AgentError::Config(format!("{}: {}", raw, e))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            urls,
            network_types,
            multicast_dns_mode,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, AgentError> {
        Self::new(
            &config.stun_urls,
            config.network_types.clone(),
            config.multicast_dns_mode,
        )
    }

    pub fn stun_server_count(&self) -> usize {
        self.urls.len()
    }

    pub fn multicast_dns_mode(&self) -> MulticastDnsMode {
        self.multicast_dns_mode
    }
}

#[async_trait]
impl AgentFactory for IceAgentFactory {
    async fn create(&self) -> Result<NewAgent, AgentError> {
        let agent = Agent::new(AgentConfig {
            urls: self.urls.clone(),
            network_types: self.network_types.clone(),
            multicast_dns_mode: self.multicast_dns_mode,
            ..Default::default()
        })
        .await?;

        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_QUEUE);
        agent.on_candidate(Box::new(
            move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
                let tx = candidate_tx.clone();
                Box::pin(async move {
                    let item = match candidate {
                        Some(c) => Gathered::Candidate(c.marshal()),
                        None => Gathered::Complete,
                    };
                    if tx.send(item).await.is_err() {
                        debug!("Candidate receiver dropped");
                    }
                })
            },
        ));

        let (state_tx, state_rx) = watch::channel(LinkState::New);
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            debug!("ICE connection state: {}", state);
            state_tx.send_replace(LinkState::from(state));
            Box::pin(async {})
        }));

        agent.gather_candidates()?;
        let (ufrag, pwd) = agent.get_local_user_credentials().await;

        Ok(NewAgent {
            agent: Arc::new(IceAgent { agent }),
            credentials: Credentials { ufrag, pwd },
            candidates: candidate_rx,
            states: state_rx,
        })
    }
}

pub struct IceAgent {
    agent: Agent,
}

#[async_trait]
impl ConnectivityAgent for IceAgent {
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), AgentError> {
        let parsed = unmarshal_candidate(candidate).map_err(|e| AgentError::Decode(e.to_string()))?;
        let parsed: Arc<dyn Candidate + Send + Sync> = Arc::new(parsed);
        self.agent.add_remote_candidate(&parsed)?;
        Ok(())
    }

    async fn dial(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError> {
        // the agent aborts as soon as this sender is dropped
        let (_cancel_tx, cancel_rx) = mpsc::channel(1);
        let conn: Arc<dyn Conn + Send + Sync> =
            self.agent.dial(cancel_rx, remote.ufrag, remote.pwd).await?;
        Ok(Arc::new(IceLink { conn }))
    }

    async fn accept(&self, remote: Credentials) -> Result<Arc<dyn Link>, AgentError> {
        let (_cancel_tx, cancel_rx) = mpsc::channel(1);
        let conn: Arc<dyn Conn + Send + Sync> =
            self.agent.accept(cancel_rx, remote.ufrag, remote.pwd).await?;
        Ok(Arc::new(IceLink { conn }))
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.agent.close().await?;
        Ok(())
    }
}

struct IceLink {
    conn: Arc<dyn Conn + Send + Sync>,
}

#[async_trait]
impl Link for IceLink {
    async fn send(&self, buf: &[u8]) -> Result<usize, AgentError> {
        Ok(self.conn.send(buf).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError> {
        Ok(self.conn.recv(buf).await?)
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.conn.close().await?;
        Ok(())
    }
}
