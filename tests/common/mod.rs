//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ws_router::io::{BufferPool, RELAY_BUFFER_SIZE};

/// A TCP echo server on an ephemeral port.
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Reserve an ephemeral address. The port is released before use, so a
/// listener configured with it can bind shortly after.
pub async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Connect with retries, waiting for a freshly spawned listener to bind.
pub async fn connect_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("listener on {addr} never came up");
}

/// Wait until something accepts on `addr`, then drop the probe connection.
pub async fn wait_listening(addr: SocketAddr) {
    drop(connect_retry(addr).await);
}

pub fn relay_pool() -> Arc<BufferPool> {
    Arc::new(BufferPool::new(32, RELAY_BUFFER_SIZE))
}
