//! UDP tunneling with per-source associations
//!
//! Each inbound source address gets one outbound socket, a NAT-like
//! association. Associations dial lazily: the first packet creates the
//! outbound socket and its reader task; a failed dial drops the packet and
//! leaves the entry socketless so the next packet retries. Associations are
//! evicted after an idle period, on outbound read errors, and on write-back
//! errors; eviction drops the last `Arc` and closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UdpConfig;
use crate::error::{UdpError, WsRouterError};
use crate::io::BufferPool;

use super::reserved::{clear_reply, mask_outbound};

/// One source address's outbound state.
struct UdpAssociation {
    /// Lazily dialed outbound socket; the async mutex serializes the dial so
    /// concurrent packets from one source produce exactly one socket.
    outbound: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    /// Eviction deadline, pushed forward on activity.
    deadline: parking_lot::Mutex<Instant>,
}

impl UdpAssociation {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            outbound: tokio::sync::Mutex::new(None),
            deadline: parking_lot::Mutex::new(Instant::now() + idle_timeout),
        }
    }

    fn touch(&self, idle_timeout: Duration) {
        *self.deadline.lock() = Instant::now() + idle_timeout;
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }
}

/// A UDP tunnel: one inbound listener forwarding to a fixed target.
pub struct UdpTunnel {
    listen: String,
    target: String,
    reserved: Vec<u8>,
    idle_timeout: Duration,
    sessions: DashMap<SocketAddr, Arc<UdpAssociation>>,
    pool: Arc<BufferPool>,
}

impl UdpTunnel {
    /// Build a tunnel from its configuration.
    #[must_use]
    pub fn from_config(config: &UdpConfig, pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            listen: config.listen.clone(),
            target: config.target.clone(),
            reserved: config.reserved.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            sessions: DashMap::new(),
            pool,
        })
    }

    /// Number of live associations.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Bind the inbound socket and forward datagrams until aborted.
    pub async fn run(self: Arc<Self>) -> Result<(), WsRouterError> {
        let inbound = UdpSocket::bind(&self.listen)
            .await
            .map_err(|e| UdpError::bind(&self.listen, e.to_string()))?;
        info!(
            listen = %self.listen,
            dest = %self.target,
            rewrite = !self.reserved.is_empty(),
            "UDP tunnel listening"
        );
        self.serve(Arc::new(inbound)).await
    }

    async fn serve(self: Arc<Self>, inbound: Arc<UdpSocket>) -> Result<(), WsRouterError> {
        loop {
            let mut buf = self.pool.get();
            let (len, src) = match inbound.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    let err = UdpError::IoError(e);
                    if err.is_recoverable() {
                        continue;
                    }
                    return Err(err.into());
                }
            };
            let tunnel = Arc::clone(&self);
            let inbound = Arc::clone(&inbound);
            tokio::spawn(async move {
                tunnel.forward(inbound, src, buf, len).await;
            });
        }
    }

    /// Forward one inbound datagram through its source's association.
    async fn forward(
        self: Arc<Self>,
        inbound: Arc<UdpSocket>,
        src: SocketAddr,
        mut buf: crate::io::PooledBuffer,
        len: usize,
    ) {
        let assoc = Arc::clone(
            self.sessions
                .entry(src)
                .or_insert_with(|| Arc::new(UdpAssociation::new(self.idle_timeout)))
                .value(),
        );

        let socket = {
            let mut guard = assoc.outbound.lock().await;
            match guard.as_ref() {
                Some(socket) => Arc::clone(socket),
                None => match self.dial_outbound().await {
                    Ok(socket) => {
                        let socket = Arc::new(socket);
                        *guard = Some(Arc::clone(&socket));
                        tokio::spawn(Arc::clone(&self).read_replies(
                            Arc::clone(&assoc),
                            Arc::clone(&socket),
                            inbound,
                            src,
                        ));
                        socket
                    }
                    Err(e) => {
                        // Packet dropped; the entry stays socketless so the
                        // next packet retries the dial.
                        debug!(%src, dest = %self.target, error = %e, "outbound dial failed");
                        return;
                    }
                },
            }
        };

        let payload = &mut buf[..len];
        mask_outbound(payload, &self.reserved);
        match socket.send(payload).await {
            Ok(_) => assoc.touch(self.idle_timeout),
            // Only the reader task evicts; tearing down here would leave its
            // reader orphaned and a second socket would get dialed for the
            // same source.
            Err(e) => debug!(%src, error = %e, "outbound send failed"),
        }
    }

    async fn dial_outbound(&self) -> Result<UdpSocket, UdpError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.target).await?;
        Ok(socket)
    }

    /// Pump replies from the outbound socket back to the original source.
    ///
    /// Runs until the idle deadline passes without activity or either socket
    /// errors, then removes the association.
    async fn read_replies(
        self: Arc<Self>,
        assoc: Arc<UdpAssociation>,
        socket: Arc<UdpSocket>,
        inbound: Arc<UdpSocket>,
        src: SocketAddr,
    ) {
        let mut buf = self.pool.get();
        loop {
            let len = match tokio::time::timeout_at(assoc.deadline(), socket.recv(&mut buf)).await
            {
                Err(_) => {
                    // The deadline may have been pushed forward by a write
                    // that happened after this sleep was armed.
                    if Instant::now() >= assoc.deadline() {
                        debug!(%src, "association idle, evicting");
                        break;
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    debug!(%src, error = %e, "outbound read failed, evicting association");
                    break;
                }
                Ok(Ok(len)) => len,
            };
            assoc.touch(self.idle_timeout);
            clear_reply(&mut buf[..len], &self.reserved);
            if let Err(e) = inbound.send_to(&buf[..len], src).await {
                warn!(%src, error = %e, "reply write-back failed, evicting association");
                break;
            }
        }
        self.evict_own(src, &assoc);
    }

    /// Remove `src`'s table entry only if it is still `assoc`.
    ///
    /// A reader that lingered past its association's replacement must not
    /// delete the replacement out from under its own reader.
    fn evict_own(&self, src: SocketAddr, assoc: &Arc<UdpAssociation>) {
        self.sessions
            .remove_if(&src, |_, current| Arc::ptr_eq(current, assoc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::UDP_BUFFER_SIZE;

    async fn spawn_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    async fn spawn_tunnel(target: SocketAddr, reserved: Vec<u8>, idle_secs: u64) -> (Arc<UdpTunnel>, SocketAddr) {
        let config = UdpConfig {
            listen: "127.0.0.1:0".to_string(),
            target: target.to_string(),
            reserved,
            idle_timeout_secs: idle_secs,
        };
        let pool = Arc::new(BufferPool::new(16, UDP_BUFFER_SIZE));
        let tunnel = UdpTunnel::from_config(&config, pool);

        let inbound = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = inbound.local_addr().unwrap();
        tokio::spawn(Arc::clone(&tunnel).serve(inbound));
        (tunnel, addr)
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let echo = spawn_udp_echo().await;
        let (tunnel, tunnel_addr) = spawn_tunnel(echo, vec![], 300).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", tunnel_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, tunnel_addr);
        assert_eq!(tunnel.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_one_association_per_source() {
        let echo = spawn_udp_echo().await;
        let (tunnel, tunnel_addr) = spawn_tunnel(echo, vec![], 300).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..4 {
            client.send_to(b"burst", tunnel_addr).await.unwrap();
        }
        let mut buf = [0u8; 64];
        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(tunnel.active_sessions(), 1);

        // A second source gets its own association.
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(b"hello", tunnel_addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), other.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tunnel.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_idle_association_evicted() {
        let echo = spawn_udp_echo().await;
        let (tunnel, tunnel_addr) = spawn_tunnel(echo, vec![], 1).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", tunnel_addr).await.unwrap();
        let mut buf = [0u8; 64];
        tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tunnel.active_sessions(), 1);

        // Past the idle deadline the reader task removes the association.
        tokio::time::timeout(Duration::from_secs(5), async {
            while tunnel.active_sessions() != 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        // The next packet dials fresh and traffic flows again.
        client.send_to(b"again", tunnel_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"again");
        assert_eq!(tunnel.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_stale_reader_cleanup_spares_replacement() {
        let config = UdpConfig {
            listen: "127.0.0.1:0".to_string(),
            target: "127.0.0.1:9".to_string(),
            reserved: vec![],
            idle_timeout_secs: 300,
        };
        let pool = Arc::new(BufferPool::new(4, UDP_BUFFER_SIZE));
        let tunnel = UdpTunnel::from_config(&config, pool);
        let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let stale = Arc::new(UdpAssociation::new(tunnel.idle_timeout));
        let replacement = Arc::new(UdpAssociation::new(tunnel.idle_timeout));
        tunnel.sessions.insert(src, Arc::clone(&replacement));

        // A reader outliving its replaced association leaves the table alone.
        tunnel.evict_own(src, &stale);
        assert_eq!(tunnel.active_sessions(), 1);
        assert!(Arc::ptr_eq(
            tunnel.sessions.get(&src).unwrap().value(),
            &replacement
        ));

        // The replacement's own reader removes it.
        tunnel.evict_own(src, &replacement);
        assert_eq!(tunnel.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_reserved_bytes_rewritten_both_ways() {
        // The receiver checks what actually arrived on the wire.
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_tunnel, tunnel_addr) = spawn_tunnel(target, vec![0xaa, 0xbb], 300).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&[9, 1, 2, 3, 4], tunnel_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, peer) = receiver.recv_from(&mut buf).await.unwrap();
        // Bytes 1..=2 carry the template; byte 0 and the tail pass through.
        assert_eq!(&buf[..n], &[9, 0xaa, 0xbb, 3, 4]);

        // Replies get the same range zeroed before write-back.
        receiver
            .send_to(&[7, 0xde, 0xad, 5, 6], peer)
            .await
            .unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[7, 0, 0, 5, 6]);
    }
}
