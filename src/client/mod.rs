//! Tunnel client
//!
//! A [`TunnelClient`] owns one local TCP listener. Each accepted connection
//! is carried to a remote tunnel server over a framed connection, optionally
//! through a forward proxy. The client also serves as an in-process delegate:
//! a tunnel server running in the same process can call [`TunnelClient::dial`]
//! directly instead of looping packets through the client's own listener.
//!
//! The upgrade handshake is done by hand so the client keeps ownership of the
//! raw stream; the short-circuit path needs it unframed.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ConfigError, DialError, UpgradeError, WsRouterError};
use crate::io::{read_http_head, BufferPool};
use crate::proxy::DialerRegistry;
use crate::relay::{relay_stream_framed, set_keepalive, tunnel_ws_config};
use crate::server::early_data::encode_early_data;

mod registry;

pub use registry::ClientRegistry;

/// A framed connection to a remote tunnel server.
///
/// Owns the raw stream plus any bytes the server sent past its 101 response.
/// The caller decides whether to layer framing back on or relay raw.
pub struct FramedConn {
    stream: TcpStream,
    read_buf: Vec<u8>,
}

impl FramedConn {
    /// Wrap the connection in the framing layer (client role).
    pub async fn into_framed(self) -> WebSocketStream<TcpStream> {
        WebSocketStream::from_partially_read(
            self.stream,
            self.read_buf,
            Role::Client,
            Some(tunnel_ws_config()),
        )
        .await
    }

    /// Surrender the raw stream and any buffered post-handshake bytes.
    #[must_use]
    pub fn into_raw(self) -> (TcpStream, Vec<u8>) {
        (self.stream, self.read_buf)
    }
}

/// A tunnel client bound to one local listener and one remote server.
pub struct TunnelClient {
    listen: String,
    remote_addr: String,
    path: String,
    host_header: String,
    proxy: Option<Url>,
    dialers: Arc<DialerRegistry>,
    pool: Arc<BufferPool>,
}

impl TunnelClient {
    /// Build a client from its configuration.
    pub fn from_config(
        config: &ClientConfig,
        dialers: Arc<DialerRegistry>,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>, WsRouterError> {
        let remote = Url::parse(&config.remote).map_err(|e| {
            ConfigError::ValidationError(format!("invalid remote URL {}: {e}", config.remote))
        })?;
        let host = remote
            .host_str()
            .ok_or_else(|| {
                ConfigError::ValidationError(format!("remote URL has no host: {}", config.remote))
            })?
            .to_string();
        let port = remote.port().unwrap_or(80);

        let path = match remote.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let proxy = match &config.proxy {
            Some(raw) => Some(Url::parse(raw).map_err(|e| {
                ConfigError::ValidationError(format!("invalid proxy URL {raw}: {e}"))
            })?),
            None => None,
        };

        Ok(Arc::new(Self {
            listen: config.listen.clone(),
            remote_addr: format!("{host}:{port}"),
            host_header: if port == 80 {
                host
            } else {
                format!("{host}:{port}")
            },
            path,
            proxy,
            dialers,
            pool,
        }))
    }

    /// Remote tunnel server address, "host:port".
    #[must_use]
    pub fn target(&self) -> &str {
        &self.remote_addr
    }

    /// Upgrade path requested on the remote server.
    #[must_use]
    pub fn server_upgrade_path(&self) -> &str {
        &self.path
    }

    /// Human-readable description of the configured proxy.
    #[must_use]
    pub fn proxy_description(&self) -> String {
        match &self.proxy {
            Some(url) => url.to_string(),
            None => "none".to_string(),
        }
    }

    /// Open a framed connection to the remote tunnel server.
    ///
    /// `early_data` is smuggled in the upgrade request when it fits the
    /// header codec; an inbound `Sec-WebSocket-Protocol` value in `headers`
    /// is forwarded verbatim instead (it already carries the peer's early
    /// data in encoded form).
    pub async fn dial(
        &self,
        early_data: &[u8],
        headers: Option<&HeaderMap>,
    ) -> Result<FramedConn, DialError> {
        let mut stream = match &self.proxy {
            Some(proxy) => self.dialers.dial(proxy, &self.remote_addr).await?,
            None => TcpStream::connect(&self.remote_addr)
                .await
                .map_err(|e| DialError::connect_failed(&self.remote_addr, e.to_string()))?,
        };
        if let Err(e) = set_keepalive(&stream) {
            debug!(error = %e, "failed to enable keepalive on tunnel connection");
        }

        let key = generate_key();
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n",
            self.path, self.host_header,
        );
        let forwarded = headers
            .and_then(|h| h.get(SEC_WEBSOCKET_PROTOCOL))
            .and_then(|v| v.to_str().ok());
        if let Some(protocol) = forwarded {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(protocol);
            request.push_str("\r\n");
        } else if !early_data.is_empty() {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(&encode_early_data(early_data));
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(UpgradeError::IoError)?;

        let (head, read_buf) = read_http_head(&mut stream)
            .await
            .map_err(UpgradeError::IoError)?;
        validate_upgrade_response(&head, &key)?;

        debug!(remote = %self.remote_addr, path = %self.path, "tunnel connection established");
        Ok(FramedConn { stream, read_buf })
    }

    /// Run the local listener until the task is aborted.
    ///
    /// Per-connection failures are logged and end only that connection.
    pub async fn run(self: Arc<Self>) -> Result<(), WsRouterError> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!(
            listen = %self.listen,
            remote = %self.remote_addr,
            path = %self.path,
            proxy = %self.proxy_description(),
            "tunnel client listening"
        );

        loop {
            let (local, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let client = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(%peer, "local connection accepted");
                let conn = match client.dial(&[], None).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(%peer, error = %e, "tunnel dial failed");
                        return;
                    }
                };
                let framed = conn.into_framed().await;
                let result = relay_stream_framed(local, framed, &client.pool).await;
                debug!(
                    %peer,
                    sent = result.stream_to_framed,
                    received = result.framed_to_stream,
                    "session finished"
                );
            });
        }
    }
}

/// Check a client handshake response head: 101 with a matching accept key.
fn validate_upgrade_response(head: &[u8], sent_key: &str) -> Result<(), UpgradeError> {
    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_buf);
    response
        .parse(head)
        .map_err(|e| UpgradeError::Malformed(e.to_string()))?;

    match response.code {
        Some(101) => {}
        Some(code) => {
            let reason = response.reason.unwrap_or("").to_string();
            return Err(UpgradeError::Refused(format!("{code} {reason}")));
        }
        None => return Err(UpgradeError::Malformed("missing status code".into())),
    }

    let expected = derive_accept_key(sent_key.as_bytes());
    let accept = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|h| h.value);
    match accept {
        Some(value) if value == expected.as_bytes() => Ok(()),
        _ => Err(UpgradeError::AcceptMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_response_accepts_matching_key() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        );
        assert!(validate_upgrade_response(head.as_bytes(), key).is_ok());
    }

    #[test]
    fn test_validate_response_rejects_wrong_key() {
        let head = "HTTP/1.1 101 Switching Protocols\r\n\
             Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n";
        let err = validate_upgrade_response(head.as_bytes(), "some-key").unwrap_err();
        assert!(matches!(err, UpgradeError::AcceptMismatch));
    }

    #[test]
    fn test_validate_response_rejects_non_101() {
        let head = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let err = validate_upgrade_response(head, "some-key").unwrap_err();
        assert!(matches!(err, UpgradeError::Refused(reason) if reason == "403 Forbidden"));
    }

    #[test]
    fn test_from_config_resolves_remote() {
        let config = ClientConfig {
            listen: "127.0.0.1:1080".to_string(),
            remote: "ws://relay.example/t".to_string(),
            proxy: None,
        };
        let client = TunnelClient::from_config(
            &config,
            Arc::new(DialerRegistry::with_defaults()),
            Arc::new(BufferPool::new(4, crate::io::RELAY_BUFFER_SIZE)),
        )
        .unwrap();
        assert_eq!(client.target(), "relay.example:80");
        assert_eq!(client.server_upgrade_path(), "/t");
        assert_eq!(client.proxy_description(), "none");
    }
}
