//! Tunnel server
//!
//! A [`WsServer`] owns one TCP listener and an immutable [`RouteTable`]. Each
//! accepted connection is parsed as an upgrade request and either tunneled to
//! its route's destination or dropped. Servers are tracked in a port-keyed
//! [`ServerRegistry`], mirroring the client registry consulted for
//! short-circuit routing.

pub mod early_data;
mod handler;
pub mod router;
pub mod upgrade;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::client::ClientRegistry;
use crate::config::ServerConfig;
use crate::error::{ConfigError, WsRouterError};
use crate::io::BufferPool;

pub use router::{Route, RouteTable};
pub use upgrade::UpgradeRequest;

/// A tunnel server bound to one listen address.
pub struct WsServer {
    listen: String,
    table: Arc<RouteTable>,
    pool: Arc<BufferPool>,
}

impl WsServer {
    /// Build a server from its configuration.
    ///
    /// The route table is fixed here; short-circuit decisions consult the
    /// client registry as it stands, so clients must be registered first.
    pub fn from_config(
        config: &ServerConfig,
        clients: &ClientRegistry,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>, WsRouterError> {
        let table = RouteTable::build(config, clients);
        if table.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "server {} has no usable routes",
                config.listen
            ))
            .into());
        }
        Ok(Arc::new(Self {
            listen: config.listen.clone(),
            table: Arc::new(table),
            pool,
        }))
    }

    /// Listen address this server binds.
    #[must_use]
    pub fn listen(&self) -> &str {
        &self.listen
    }

    /// Run the accept loop until the task is aborted.
    pub async fn run(self: Arc<Self>) -> Result<(), WsRouterError> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!(
            listen = %self.listen,
            routes = self.table.len(),
            "tunnel server listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let table = Arc::clone(&self.table);
            let pool = Arc::clone(&self.pool);
            tokio::spawn(handler::handle_connection(stream, peer, table, pool));
        }
    }
}

/// Port-keyed registry of running tunnel servers.
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<WsServer>>,
}

impl ServerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server under its listen port.
    pub fn insert(&self, port: impl Into<String>, server: Arc<WsServer>) {
        self.servers.insert(port.into(), server);
    }

    /// Look up the server listening on `port`, if any.
    #[must_use]
    pub fn get(&self, port: &str) -> Option<Arc<WsServer>> {
        self.servers.get(port).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
