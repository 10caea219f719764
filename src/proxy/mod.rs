//! Forward-proxy dialers
//!
//! A [`ProxyDialer`] opens a transport connection to a target through an
//! intermediate forward proxy. Dialers are selected by the proxy URL's scheme
//! through a [`DialerRegistry`], so new proxy schemes can be added without
//! touching call sites. One attempt per call; no retries.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use url::Url;

use crate::error::ProxyError;

pub use http::HttpProxyDialer;

/// A dialer that reaches `target` ("host:port") through the given proxy.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// Open a connection to `target` via `proxy`.
    ///
    /// On failure the proxy connection is closed and never returned.
    async fn dial(&self, proxy: &Url, target: &str) -> Result<TcpStream, ProxyError>;
}

/// Scheme-keyed registry of proxy dialers.
///
/// Passed by reference into the components that dial; never ambient state.
pub struct DialerRegistry {
    dialers: DashMap<String, Arc<dyn ProxyDialer>>,
}

impl DialerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dialers: DashMap::new(),
        }
    }

    /// Create a registry with the built-in `http` dialer registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("http", Arc::new(HttpProxyDialer));
        registry
    }

    /// Register a dialer for a proxy URL scheme, replacing any existing one.
    pub fn register(&self, scheme: impl Into<String>, dialer: Arc<dyn ProxyDialer>) {
        self.dialers.insert(scheme.into(), dialer);
    }

    /// Dial `target` through `proxy`, dispatching on the proxy scheme.
    pub async fn dial(&self, proxy: &Url, target: &str) -> Result<TcpStream, ProxyError> {
        let dialer = self
            .dialers
            .get(proxy.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProxyError::UnsupportedScheme(proxy.scheme().to_string()))?;
        dialer.dial(proxy, target).await
    }
}

impl Default for DialerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Resolve a proxy URL to "host:port", defaulting the port by scheme:
/// secure schemes get 443, everything else 80.
pub(crate) fn proxy_host_port(proxy: &Url) -> Result<String, ProxyError> {
    let host = proxy
        .host_str()
        .ok_or_else(|| ProxyError::MissingHost(proxy.to_string()))?;
    let port = proxy.port().unwrap_or(match proxy.scheme() {
        "https" | "wss" => 443,
        _ => 80,
    });
    Ok(format!("{host}:{port}"))
}
