//! End-to-end tunnel tests: local listener -> framed transport -> destination.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use ws_router::client::{ClientRegistry, TunnelClient};
use ws_router::config::{ClientConfig, RouteConfig, ServerConfig};
use ws_router::io::read_http_head;
use ws_router::proxy::DialerRegistry;
use ws_router::server::WsServer;

async fn spawn_server(routes: Vec<RouteConfig>) -> SocketAddr {
    let addr = common::free_addr().await;
    let config = ServerConfig {
        listen: addr.to_string(),
        routes,
    };
    let server = WsServer::from_config(&config, &ClientRegistry::new(), common::relay_pool())
        .unwrap();
    tokio::spawn(server.run());
    common::wait_listening(addr).await;
    addr
}

fn client_for(remote: SocketAddr, path: &str, listen: &str) -> Arc<TunnelClient> {
    TunnelClient::from_config(
        &ClientConfig {
            listen: listen.to_string(),
            remote: format!("ws://{remote}{path}"),
            proxy: None,
        },
        Arc::new(DialerRegistry::with_defaults()),
        common::relay_pool(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_end_to_end_byte_identity() {
    let echo = common::spawn_tcp_echo().await;
    let server = spawn_server(vec![RouteConfig {
        path: "/t".to_string(),
        target: echo.to_string(),
    }])
    .await;

    let local = common::free_addr().await;
    let client = client_for(server, "/t", &local.to_string());
    tokio::spawn(client.run());

    let mut stream = common::connect_retry(local).await;

    stream.write_all(b"hello tunnel").await.unwrap();
    let mut got = [0u8; 12];
    stream.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"hello tunnel");

    // A payload spanning many relay buffers comes back byte-identical.
    let big: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
    let mut received = vec![0u8; big.len()];
    let expected = big.clone();
    let write = async {
        stream.write_all(&big).await.unwrap();
        stream.read_exact(&mut received).await.unwrap();
    };
    tokio::time::timeout(Duration::from_secs(10), write)
        .await
        .unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_early_data_arrives_before_handshake_completes() {
    // Destination acknowledges only if the first bytes are the early data.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut first = [0u8; 5];
        stream.read_exact(&mut first).await.unwrap();
        if &first == b"early" {
            stream.write_all(b"ok").await.unwrap();
        }
    });

    let server = spawn_server(vec![RouteConfig {
        path: "/".to_string(),
        target: destination.to_string(),
    }])
    .await;

    let client = client_for(server, "/", "127.0.0.1:0");
    let conn = client.dial(b"early", None).await.unwrap();
    let mut framed = conn.into_framed().await;

    let message = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.into_data(), b"ok");
}

#[tokio::test]
async fn test_early_data_header_echoed_verbatim() {
    let echo = common::spawn_tcp_echo().await;
    let server = spawn_server(vec![RouteConfig {
        path: "/".to_string(),
        target: echo.to_string(),
    }])
    .await;

    // Padded standard-alphabet value: decodes after canonicalization, and
    // the response must carry the original spelling, not a re-encoding.
    let mut stream = TcpStream::connect(server).await.unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: test\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Protocol: ZWFybHk=\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, _) = read_http_head(&mut stream).await.unwrap();
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"));
    assert!(head.contains("Sec-WebSocket-Protocol: ZWFybHk=\r\n"));
}

#[tokio::test]
async fn test_undecodable_early_data_degrades_silently() {
    let echo = common::spawn_tcp_echo().await;
    let server = spawn_server(vec![RouteConfig {
        path: "/".to_string(),
        target: echo.to_string(),
    }])
    .await;

    let mut stream = TcpStream::connect(server).await.unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: test\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Protocol: not!base64!\r\n\r\n",
        )
        .await
        .unwrap();

    // The upgrade still succeeds, but nothing is echoed.
    let (head, _) = read_http_head(&mut stream).await.unwrap();
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"));
    assert!(!head.contains("Sec-WebSocket-Protocol"));
}

#[tokio::test]
async fn test_unreachable_destination_closes_upgraded_connection() {
    // Nothing listens on the reserved address.
    let dead = common::free_addr().await;
    let server = spawn_server(vec![RouteConfig {
        path: "/".to_string(),
        target: dead.to_string(),
    }])
    .await;

    let client = client_for(server, "/", "127.0.0.1:0");
    // The handshake races the dial, so it can succeed before the dial fails.
    let Ok(conn) = client.dial(&[], None).await else {
        return;
    };
    let mut framed = conn.into_framed().await;

    let next = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap();
    match next {
        None | Some(Err(_)) => {}
        Some(Ok(Message::Close(_))) => {}
        Some(Ok(other)) => panic!("unexpected frame from dead route: {other:?}"),
    }
}

#[tokio::test]
async fn test_unbound_path_dropped_without_response() {
    let echo = common::spawn_tcp_echo().await;
    let server = spawn_server(vec![RouteConfig {
        path: "/only".to_string(),
        target: echo.to_string(),
    }])
    .await;

    let client = client_for(server, "/elsewhere", "127.0.0.1:0");
    let err = client.dial(&[], None).await;
    assert!(err.is_err());
}
