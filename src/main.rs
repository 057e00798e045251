//! Meeting Signaling Relay - Entry Point
//!
//! Starts the TCP listener and RoomRegistry actor, accepting connections.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meeting_relay::{
    serve, ChatStore, Config, JsonlChatStore, LogChatStore, RelayContext, RoomRegistry,
};

/// Channel buffer size for registry commands
const CHANNEL_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=meeting_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meeting_relay=info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.relay_settings();

    let store: Arc<dyn ChatStore> = match &config.chat_log {
        Some(path) => {
            info!("Persisting chat to {}", path.display());
            Arc::new(JsonlChatStore::open(path).await?)
        }
        None => {
            info!("No chat log configured, chat goes to the log only");
            Arc::new(LogChatStore)
        }
    };

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("Meeting relay listening on {}", config.addr);

    // Start RoomRegistry actor
    let registry = RoomRegistry::spawn(CHANNEL_BUFFER_SIZE);
    info!("RoomRegistry actor started");

    let context = Arc::new(RelayContext::new(registry, settings, store));
    serve(listener, context).await;

    Ok(())
}
