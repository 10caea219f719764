//! Bidirectional relays between raw byte streams and framed tunnel connections
//!
//! A relay owns both endpoints of a session and returns only after both
//! directions have drained. One pump copies raw bytes into binary frames;
//! the opposite pump decodes inbound messages (binary and text are both
//! data) back onto the raw stream. When both sides are raw streams the relay
//! degrades to a straight bidirectional byte copy.
//!
//! # Cancellation
//!
//! The original transport unblocked the opposite pump by forcing its read
//! deadline into the past. Tokio sockets do not allow external deadline
//! mutation, so each session carries a `CancellationToken` instead: the pump
//! that exits first cancels it, which wakes the opposite pump's pending read.
//! There is no other cancellation signal.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::io::{BufferPool, RELAY_BUFFER_SIZE};

/// TCP keepalive probe interval applied to both session endpoints.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Framing configuration for tunnel connections: small write buffer so each
/// relayed read goes out as its own frame instead of coalescing.
#[must_use]
pub fn tunnel_ws_config() -> WebSocketConfig {
    WebSocketConfig {
        write_buffer_size: RELAY_BUFFER_SIZE,
        ..Default::default()
    }
}

/// Bytes moved by a finished relay session, per direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayResult {
    /// Bytes copied from the raw stream into outbound frames (or from
    /// endpoint A to endpoint B for a raw/raw session).
    pub stream_to_framed: u64,
    /// Bytes decoded from inbound frames onto the raw stream (or from
    /// endpoint B to endpoint A).
    pub framed_to_stream: u64,
}

impl RelayResult {
    /// Total bytes moved in both directions.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.stream_to_framed + self.framed_to_stream
    }
}

/// Enable TCP keepalive with a 30-second probe interval.
///
/// Applied to plain transport sockets before pumping; failures are reported
/// to the caller, which logs and proceeds (keepalive is advisory).
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Relay between a raw TCP stream and a framed tunnel connection.
///
/// Blocks until both pumps exit. The framed side's underlying socket should
/// already have keepalive applied by the caller (it is hidden behind the
/// framing layer here).
pub async fn relay_stream_framed<S>(
    tcp: TcpStream,
    ws: WebSocketStream<S>,
    pool: &Arc<BufferPool>,
) -> RelayResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = set_keepalive(&tcp) {
        debug!(error = %e, "failed to enable keepalive on raw endpoint");
    }

    let (ws_tx, ws_rx) = ws.split();
    let (tcp_rx, tcp_tx) = tcp.into_split();
    let cancel = CancellationToken::new();

    let upstream = {
        let pool = Arc::clone(pool);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let n = pump_stream_to_framed(tcp_rx, ws_tx, &pool, &cancel).await;
            cancel.cancel();
            n
        })
    };

    let framed_to_stream = pump_framed_to_stream(ws_rx, tcp_tx, &cancel).await;
    cancel.cancel();
    let stream_to_framed = upstream.await.unwrap_or(0);

    RelayResult {
        stream_to_framed,
        framed_to_stream,
    }
}

/// Relay between two raw TCP streams (straight bidirectional byte copy).
///
/// `a_buffered`/`b_buffered` are bytes already consumed from that endpoint
/// while parsing its handshake; they are flushed to the opposite endpoint
/// before pumping starts.
pub async fn relay_stream_stream(
    a: TcpStream,
    a_buffered: Vec<u8>,
    b: TcpStream,
    b_buffered: Vec<u8>,
    pool: &Arc<BufferPool>,
) -> RelayResult {
    for endpoint in [&a, &b] {
        if let Err(e) = set_keepalive(endpoint) {
            debug!(error = %e, "failed to enable keepalive on raw endpoint");
        }
    }

    let (a_rx, a_tx) = a.into_split();
    let (b_rx, b_tx) = b.into_split();
    let cancel = CancellationToken::new();

    let upstream = {
        let pool = Arc::clone(pool);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let n = pump_stream_to_stream(a_rx, b_tx, a_buffered, &pool, &cancel).await;
            cancel.cancel();
            n
        })
    };

    let framed_to_stream = pump_stream_to_stream(b_rx, a_tx, b_buffered, pool, &cancel).await;
    cancel.cancel();
    let stream_to_framed = upstream.await.unwrap_or(0);

    RelayResult {
        stream_to_framed,
        framed_to_stream,
    }
}

/// Copy raw bytes into outbound binary frames until EOF, error, or cancel.
async fn pump_stream_to_framed<S>(
    mut rx: OwnedReadHalf,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut transferred = 0u64;
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            res = rx.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "raw read ended");
                    break;
                }
            },
        };
        if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
            debug!(error = %e, "framed write ended");
            break;
        }
        transferred += n as u64;
    }
    transferred
}

/// Decode inbound messages onto the raw stream until close, error, or cancel.
///
/// Multi-part message bodies are reassembled by the framing layer before a
/// message is surfaced here, so every item is a complete message.
async fn pump_framed_to_stream<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut tx: OwnedWriteHalf,
    cancel: &CancellationToken,
) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(error = %e, "framed read ended");
                    break;
                }
            },
        };
        let data = match message {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break,
            other => {
                trace!(frame = ?other, "non-data frame on tunnel");
                continue;
            }
        };
        if data.is_empty() {
            continue;
        }
        if let Err(e) = tx.write_all(&data).await {
            debug!(error = %e, "raw write ended");
            break;
        }
        transferred += data.len() as u64;
    }
    transferred
}

/// Copy raw bytes between two stream halves until EOF, error, or cancel.
async fn pump_stream_to_stream(
    mut rx: OwnedReadHalf,
    mut tx: OwnedWriteHalf,
    initial: Vec<u8>,
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
) -> u64 {
    let mut transferred = 0u64;
    if !initial.is_empty() {
        if let Err(e) = tx.write_all(&initial).await {
            debug!(error = %e, "raw write ended");
            return transferred;
        }
        transferred += initial.len() as u64;
    }

    let mut buf = pool.get();
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            res = rx.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "raw read ended");
                    break;
                }
            },
        };
        if let Err(e) = tx.write_all(&buf[..n]).await {
            debug!(error = %e, "raw write ended");
            break;
        }
        transferred += n as u64;
    }
    let _ = tx.shutdown().await;
    transferred
}
