//! # ws-router
//!
//! A tunnel router that carries TCP byte streams and UDP datagrams over
//! HTTP-upgradeable framed (WebSocket) transport.
//!
//! ## Architecture
//!
//! - **server**: accepts upgrade requests, routes them by path, and relays
//!   each accepted connection against its destination. Routes whose
//!   destination is an in-process tunnel client short-circuit to that client,
//!   skipping a redundant framing hop.
//! - **client**: local TCP listeners whose connections are carried to a
//!   remote tunnel server, optionally through an HTTP CONNECT proxy; also the
//!   in-process delegate behind short-circuit routes.
//! - **relay**: the bidirectional pumps (raw against framed, raw against raw)
//!   with per-session cancellation.
//! - **udp**: datagram tunneling with NAT-like per-source associations, idle
//!   eviction, and reserved-byte rewriting.
//! - **proxy**: forward-proxy dialers behind a scheme-keyed registry.
//! - **io**: the shared buffer pool and HTTP head framing.
//!
//! Early data rides inside the `Sec-WebSocket-Protocol` header of the
//! upgrade request, letting the first client payload reach the destination
//! before the handshake round trip completes.

pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod udp;

pub use client::{ClientRegistry, FramedConn, TunnelClient};
pub use config::Config;
pub use error::{Result, WsRouterError};
pub use io::BufferPool;
pub use proxy::{DialerRegistry, ProxyDialer};
pub use server::{ServerRegistry, WsServer};
pub use udp::UdpTunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
