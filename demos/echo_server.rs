//! Echo every text message back to its sender.
//!
//! ```text
//! RUST_LOG=wsengine=debug cargo run --example echo_server -- 127.0.0.1:9001
//! ```

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;
use wsengine::{Listener, Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_owned())
        .parse()?;

    let listener = Listener::new();
    listener.on_connect(|conn| {
        info!(connection = %conn.id(), "Client connected");
        let replier = conn.clone();
        conn.on_message(move |text| {
            if let Err(e) = replier.send(text) {
                info!(error = %e, "Echo failed");
            }
        });
        let id = conn.id();
        conn.on_disconnect(move || info!(connection = %id, "Client disconnected"));
    });

    let server = Server::bind(ServerConfig::default().with_bind_addr(addr), listener).await?;
    server.run().await?;
    Ok(())
}
