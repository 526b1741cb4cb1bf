use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use icelink::agent::ice::IceAgentFactory;
use icelink::client::{Guest, OnConnect, Owner, PeerLink};
use icelink::config::{ClientConfig, DEFAULT_PATH};
use icelink::signaling::SignalingServer;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const ROUNDS: usize = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    // 1. Local rendezvous server
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = Arc::new(SignalingServer::default());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    let config = ClientConfig::new(&addr.to_string(), DEFAULT_PATH);
    let factory = Arc::new(IceAgentFactory::from_config(&config)?);

    // 2. Owner opens a room and reports latency for whatever arrives
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    let on_connect: OnConnect = Arc::new(move |link: PeerLink| {
        println!("new connection from {}", link.peer());
        let done = done_tx.lock().ok().and_then(|mut d| d.take());
        tokio::spawn(async move {
            report_latency(link).await;
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
    });
    let owner = Owner::create(config.clone(), factory.clone(), on_connect).await?;
    println!("created room with id {}", owner.room_id());

    // 3. Guest joins and sends timestamps over the direct link
    let guest = Guest::join(&config, factory.as_ref(), owner.room_id()).await?;
    for _ in 0..ROUNDS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let payload = serde_json::to_vec(&now_micros())?;
        guest.link().send(&payload).await?;
    }

    guest.close().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), done_rx).await;
    owner.close().await?;
    server.shutdown();
    Ok(())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

async fn report_latency(link: PeerLink) {
    let mut buf = [0u8; 1500];
    for _ in 0..ROUNDS {
        let len = match link.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        match serde_json::from_slice::<u64>(&buf[..len]) {
            Ok(sent) => println!("{:?}", Duration::from_micros(now_micros().saturating_sub(sent))),
            Err(e) => println!("failed to decode timestamp: {}", e),
        }
    }
}
