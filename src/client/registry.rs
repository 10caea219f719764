//! Registry of in-process tunnel clients, keyed by local listen port.
//!
//! Consulted by servers at route-table build time: a route whose destination
//! is a loopback port with a registered client short-circuits to that client
//! instead of dialing through its listener.

use std::sync::Arc;

use dashmap::DashMap;

use super::TunnelClient;

/// Port-keyed registry of running tunnel clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<TunnelClient>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its local listen port.
    pub fn insert(&self, port: impl Into<String>, client: Arc<TunnelClient>) {
        self.clients.insert(port.into(), client);
    }

    /// Look up the client listening on `port`, if any.
    #[must_use]
    pub fn get(&self, port: &str) -> Option<Arc<TunnelClient>> {
        self.clients.get(port).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
