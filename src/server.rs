//! Relay wiring
//!
//! Shared per-process context handed to every connection handler, and
//! the connection accept loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::handler::handle_connection;
use crate::registry::RegistryHandle;
use crate::store::ChatStore;

/// Default bound on the pending-admission wait
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-peer outbound queue capacity
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Runtime settings for connection handlers
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// How long a candidate may wait for the admin's decision
    pub admission_timeout: Duration,
    /// Close active connections silent for this long
    pub idle_timeout: Option<Duration>,
    /// Whether broadcasts skip their sender
    pub exclude_sender: bool,
    /// Per-peer outbound queue capacity; a full queue evicts the peer
    pub outbound_buffer: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            admission_timeout: DEFAULT_ADMISSION_TIMEOUT,
            idle_timeout: None,
            exclude_sender: true,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

/// Everything a connection handler needs besides its socket
pub struct RelayContext {
    pub registry: RegistryHandle,
    pub settings: RelaySettings,
    pub store: Arc<dyn ChatStore>,
}

impl RelayContext {
    pub fn new(
        registry: RegistryHandle,
        settings: RelaySettings,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            registry,
            settings,
            store,
        }
    }
}

/// Accept connections forever, one handler task per connection
pub async fn serve(listener: TcpListener, context: Arc<RelayContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let context = context.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, context).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
