use icelink::config::{DEFAULT_PATH, DEFAULT_SIGNALING_PORT};
use icelink::signaling::SignalingServer;
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_SIGNALING_PORT));

    println!("   icelink rendezvous server");
    println!("   Binding to ws://{}{}", bind_addr, DEFAULT_PATH);
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::default();
    tokio::select! {
        result = server.run(&bind_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.shutdown();
            Ok(())
        }
    }
}
