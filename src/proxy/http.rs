//! HTTP CONNECT forward-proxy dialer

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::ProxyError;
use crate::io::read_http_head;

use super::{proxy_host_port, ProxyDialer};

/// Dialer for `http://` forward proxies using the CONNECT method.
///
/// Sends exactly one CONNECT request, parses exactly one response head, and
/// returns the connection only for a status of exactly 200. Any other status
/// closes the connection and yields a failure carrying the reason phrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProxyDialer;

#[async_trait]
impl ProxyDialer for HttpProxyDialer {
    async fn dial(&self, proxy: &Url, target: &str) -> Result<TcpStream, ProxyError> {
        let proxy_addr = proxy_host_port(proxy)?;
        let mut stream = TcpStream::connect(&proxy_addr)
            .await
            .map_err(|e| ProxyError::ConnectFailed {
                addr: proxy_addr.clone(),
                reason: e.to_string(),
            })?;

        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if !proxy.username().is_empty() {
            if let Some(password) = proxy.password() {
                let credential = STANDARD.encode(format!("{}:{password}", proxy.username()));
                request.push_str(&format!("Proxy-Authorization: Basic {credential}\r\n"));
            }
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        // Trailing bytes past the response head are discarded: the remote
        // server does not speak until spoken to.
        let (head, trailing) = read_http_head(&mut stream).await?;
        if !trailing.is_empty() {
            debug!(
                proxy = %proxy_addr,
                bytes = trailing.len(),
                "discarding bytes received before CONNECT completed"
            );
        }

        let (code, reason) = parse_status_line(&head)?;
        if code != 200 {
            return Err(ProxyError::Refused(reason));
        }
        debug!(proxy = %proxy_addr, dest = target, "CONNECT tunnel established");
        Ok(stream)
    }
}

/// Parse the status line of a CONNECT response head.
fn parse_status_line(head: &[u8]) -> Result<(u16, String), ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(head)
        .map_err(|e| ProxyError::MalformedResponse(e.to_string()))?;

    let code = response
        .code
        .ok_or_else(|| ProxyError::MalformedResponse("missing status code".into()))?;
    let reason = response.reason.unwrap_or("").to_string();
    Ok((code, reason))
}
