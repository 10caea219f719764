//! Upgrade routing
//!
//! Routes are decided once, when the table is built from configuration:
//! a destination on a loopback address whose port belongs to a tunnel client
//! in this process binds to that client directly, every other destination
//! binds to an outbound dial. Per-connection handling never re-examines the
//! destination.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{ClientRegistry, TunnelClient};
use crate::config::ServerConfig;

/// Where connections on one path go.
#[derive(Clone)]
pub enum Route {
    /// Dial the destination address per connection.
    Dial { target: String },
    /// Hand off to an in-process tunnel client, bypassing its listener.
    ShortCircuit { client: Arc<TunnelClient> },
}

/// Immutable path-to-route table for one listener.
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    /// Build the table from a server's route list.
    ///
    /// Malformed destination addresses are logged and the path skipped; the
    /// remaining routes still serve.
    #[must_use]
    pub fn build(config: &ServerConfig, clients: &ClientRegistry) -> Self {
        let mut routes = HashMap::new();
        for entry in &config.routes {
            let Some((host, port)) = split_host_port(&entry.target) else {
                warn!(
                    listen = %config.listen,
                    path = %entry.path,
                    dest = %entry.target,
                    "skipping route with malformed target address"
                );
                continue;
            };

            let route = match is_loopback_host(host).then(|| clients.get(port)).flatten() {
                Some(client) => {
                    debug!(
                        listen = %config.listen,
                        path = %entry.path,
                        dest = %entry.target,
                        remote = %client.target(),
                        "route short-circuits to in-process client"
                    );
                    Route::ShortCircuit { client }
                }
                None => Route::Dial {
                    target: entry.target.clone(),
                },
            };
            routes.insert(entry.path.clone(), route);
        }
        Self { routes }
    }

    /// Exact path match, falling back to the `/` route when bound.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes.get(path).or_else(|| self.routes.get("/"))
    }

    /// Number of bound paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no path survived the build.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Split "host:port" requiring a numeric port; returns `None` when malformed.
fn split_host_port(target: &str) -> Option<(&str, &str)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some((host.trim_matches(['[', ']']), port))
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}
