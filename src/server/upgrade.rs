//! Server-side upgrade handshake
//!
//! The handshake is performed by hand rather than through a framing-library
//! accept: the short-circuit path relays the post-upgrade raw stream
//! directly, so the server must keep ownership of the socket (and of any
//! 0-RTT bytes that arrived glued to the request head). Framing is layered
//! back on afterwards with `WebSocketStream::from_partially_read` where a
//! handler needs it.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};

use crate::error::UpgradeError;
use crate::io::read_http_head;

/// A parsed inbound upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest {
    method: String,
    path: String,
    headers: HeaderMap,
    /// Bytes received past the request head; they belong to the tunnel.
    trailing: Vec<u8>,
}

impl UpgradeRequest {
    /// Read and parse one upgrade request head from the stream.
    pub async fn read_from<S>(stream: &mut S) -> Result<Self, UpgradeError>
    where
        S: AsyncRead + Unpin,
    {
        let (head, trailing) = read_http_head(stream).await.map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => UpgradeError::UnexpectedEof,
            io::ErrorKind::InvalidData => UpgradeError::RequestTooLarge,
            _ => UpgradeError::IoError(e),
        })?;

        let mut header_buf = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut header_buf);
        match request.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(UpgradeError::Malformed("incomplete request head".into()));
            }
            Err(e) => return Err(UpgradeError::Malformed(e.to_string())),
        }

        let method = request.method.unwrap_or_default().to_string();
        // Route matching is on the path only; drop any query string.
        let target = request.path.unwrap_or("/");
        let path = target.split('?').next().unwrap_or("/").to_string();

        let mut headers = HeaderMap::new();
        for header in request.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| UpgradeError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| UpgradeError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Self {
            method,
            path,
            headers,
            trailing,
        })
    }

    /// Request path with any query string removed.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All request headers (forwarded to in-process delegates on dial).
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The `Sec-WebSocket-Protocol` value, if it is valid UTF-8.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.headers
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
    }

    /// Take the 0-RTT bytes that arrived after the request head.
    #[must_use]
    pub fn take_trailing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.trailing)
    }

    /// Whether this is a genuine WebSocket upgrade request.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        if !self.method.eq_ignore_ascii_case("GET") {
            return false;
        }
        if !self.header_contains_token(&CONNECTION, "upgrade") {
            return false;
        }
        let upgrade_ok = self
            .headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let version_ok = self
            .headers
            .get(SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v.as_bytes() == b"13");
        upgrade_ok && version_ok && self.headers.contains_key(SEC_WEBSOCKET_KEY)
    }

    fn header_contains_token(&self, name: &HeaderName, token: &str) -> bool {
        self.headers.get_all(name).iter().any(|value| {
            value
                .to_str()
                .map(|v| {
                    v.split(',')
                        .any(|part| part.trim().eq_ignore_ascii_case(token))
                })
                .unwrap_or(false)
        })
    }

    /// Write the 101 Switching Protocols response for this request.
    ///
    /// `echo_protocol` carries the client's original early-data header value,
    /// echoed unchanged when it decoded successfully.
    pub async fn accept<S>(
        &self,
        stream: &mut S,
        echo_protocol: Option<&str>,
    ) -> Result<(), UpgradeError>
    where
        S: AsyncWrite + Unpin,
    {
        let key = self
            .headers
            .get(SEC_WEBSOCKET_KEY)
            .ok_or(UpgradeError::NotWebSocket)?;
        let accept = derive_accept_key(key.as_bytes());

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {accept}\r\n"
        );
        if let Some(protocol) = echo_protocol {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(protocol);
            response.push_str("\r\n");
        }
        response.push_str("\r\n");

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}
