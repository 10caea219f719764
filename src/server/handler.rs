//! Per-connection upgrade handling
//!
//! Both handlers overlap the outbound dial with the 101 response: the dial
//! runs in its own task and reports through a oneshot channel. Whichever side
//! fails first, the other side's orphaned connection is dropped — a dial
//! result that finds its receiver gone closes the dialed socket, and a failed
//! dial closes the already-upgraded inbound stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::client::{FramedConn, TunnelClient};
use crate::error::DialError;
use crate::io::BufferPool;
use crate::relay::{relay_stream_framed, relay_stream_stream, set_keepalive, tunnel_ws_config};

use super::early_data::decode_early_data;
use super::router::{Route, RouteTable};
use super::upgrade::UpgradeRequest;

/// Handle one accepted connection end to end.
///
/// Anything that is not a routable upgrade is dropped without a response.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: Arc<RouteTable>,
    pool: Arc<BufferPool>,
) {
    let mut request = match UpgradeRequest::read_from(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            debug!(%peer, error = %e, "dropping connection: unreadable request");
            return;
        }
    };
    if !request.is_websocket_upgrade() {
        debug!(%peer, path = request.path(), "dropping non-upgrade request");
        return;
    }
    let Some(route) = table.lookup(request.path()) else {
        debug!(%peer, path = request.path(), "dropping request for unbound path");
        return;
    };

    // Early data rides in on the protocol header; a value that fails to
    // decode means no early data, and only a decoded value gets echoed.
    let early_data = request.protocol().and_then(decode_early_data);
    let echo = match early_data {
        Some(_) => request.protocol().map(str::to_owned),
        None => None,
    };

    match route {
        Route::Dial { target } => {
            handle_dial(
                stream, peer, &mut request, target, early_data, echo, &pool,
            )
            .await;
        }
        Route::ShortCircuit { client } => {
            handle_short_circuit(stream, peer, &mut request, client, echo, &pool).await;
        }
    }
}

/// Normal route: dial the destination, then relay raw against framed.
async fn handle_dial(
    mut stream: TcpStream,
    peer: SocketAddr,
    request: &mut UpgradeRequest,
    target: &str,
    early_data: Option<Vec<u8>>,
    echo: Option<String>,
    pool: &Arc<BufferPool>,
) {
    let (result_tx, result_rx) = oneshot::channel();
    {
        let target = target.to_string();
        tokio::spawn(async move {
            let result = dial_destination(&target, early_data.as_deref()).await;
            // A dead receiver means the handshake side already failed; the
            // dialed connection is dropped here.
            let _ = result_tx.send(result);
        });
    }

    if let Err(e) = request.accept(&mut stream, echo.as_deref()).await {
        warn!(%peer, error = %e, "handshake response failed");
        return;
    }

    let destination = match result_rx.await {
        Ok(Ok(destination)) => destination,
        Ok(Err(e)) => {
            warn!(%peer, dest = target, error = %e, "destination dial failed");
            return;
        }
        Err(_) => return,
    };

    // The inbound socket disappears behind the framing layer, so keepalive
    // must go on before wrapping; the relay covers the destination side.
    if let Err(e) = set_keepalive(&stream) {
        debug!(%peer, error = %e, "failed to enable keepalive on tunnel endpoint");
    }
    let framed = WebSocketStream::from_partially_read(
        stream,
        request.take_trailing(),
        Role::Server,
        Some(tunnel_ws_config()),
    )
    .await;
    let result = relay_stream_framed(destination, framed, pool).await;
    debug!(
        %peer,
        dest = target,
        to_destination = result.framed_to_stream,
        to_tunnel = result.stream_to_framed,
        "session finished"
    );
}

/// Short-circuit route: dial through the in-process client and relay the two
/// raw streams directly; the frames pass through unexamined.
async fn handle_short_circuit(
    mut stream: TcpStream,
    peer: SocketAddr,
    request: &mut UpgradeRequest,
    client: &Arc<TunnelClient>,
    echo: Option<String>,
    pool: &Arc<BufferPool>,
) {
    let (result_tx, result_rx) = oneshot::channel::<Result<FramedConn, DialError>>();
    {
        let client = Arc::clone(client);
        // The protocol header is forwarded verbatim inside the headers; the
        // remote end decodes the early data itself.
        let headers = request.headers().clone();
        tokio::spawn(async move {
            let result = client.dial(&[], Some(&headers)).await;
            let _ = result_tx.send(result);
        });
    }

    if let Err(e) = request.accept(&mut stream, echo.as_deref()).await {
        warn!(%peer, error = %e, "handshake response failed");
        return;
    }

    let conn = match result_rx.await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!(%peer, remote = client.target(), error = %e, "delegate dial failed");
            return;
        }
        Err(_) => return,
    };

    let (remote, remote_buffered) = conn.into_raw();
    let result = relay_stream_stream(
        stream,
        request.take_trailing(),
        remote,
        remote_buffered,
        pool,
    )
    .await;
    debug!(
        %peer,
        remote = client.target(),
        forwarded = result.stream_to_framed,
        returned = result.framed_to_stream,
        "short-circuit session finished"
    );
}

/// Connect to the destination and deliver early data before relaying.
async fn dial_destination(
    target: &str,
    early_data: Option<&[u8]>,
) -> Result<TcpStream, DialError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| DialError::connect_failed(target, e.to_string()))?;
    if let Some(data) = early_data {
        if !data.is_empty() {
            stream.write_all(data).await?;
        }
    }
    Ok(stream)
}
