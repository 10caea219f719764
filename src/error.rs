//! Error types for ws-router
//!
//! This module defines the error hierarchy for the tunnel router.
//! Errors are categorized by subsystem; per-session errors are handled
//! locally by the task that hit them and never crash the process.

use std::io;

use thiserror::Error;

/// Top-level error type for ws-router
#[derive(Debug, Error)]
pub enum WsRouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP upgrade handshake errors
    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Outbound dial errors (destination TCP, tunnel handshake)
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Forward-proxy CONNECT errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// UDP tunnel errors
    #[error("UDP error: {0}")]
    Udp(#[from] UdpError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WsRouterError {
    /// Check if this error is recoverable (the listener keeps serving)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Upgrade(_) | Self::Dial(_) | Self::Proxy(_) => true,
            Self::Udp(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// HTTP upgrade handshake errors
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Request head exceeded the size cap before the blank line
    #[error("Upgrade request head too large")]
    RequestTooLarge,

    /// Peer closed before sending a complete request head
    #[error("Connection closed before request head completed")]
    UnexpectedEof,

    /// Request could not be parsed as HTTP/1.1
    #[error("Malformed upgrade request: {0}")]
    Malformed(String),

    /// Request parsed but is not a genuine WebSocket upgrade
    #[error("Not a WebSocket upgrade request")]
    NotWebSocket,

    /// Handshake response was not a 101 Switching Protocols
    #[error("Upgrade refused: {0}")]
    Refused(String),

    /// `Sec-WebSocket-Accept` did not match the key we sent
    #[error("Upgrade accept key mismatch")]
    AcceptMismatch,

    /// I/O error during the handshake
    #[error("Upgrade I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Dial errors for the tunnel client and server destination dials
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect to the destination failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Forward-proxy CONNECT failed
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Tunnel upgrade handshake with the remote endpoint failed
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    /// I/O error after the connection was established
    #[error("Dial I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DialError {
    /// Create a connect failed error
    pub fn connect_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Forward-proxy CONNECT errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No dialer registered for the proxy URL scheme
    #[error("No proxy dialer registered for scheme '{0}'")]
    UnsupportedScheme(String),

    /// Proxy URL has no usable host
    #[error("Proxy URL has no host: {0}")]
    MissingHost(String),

    /// TCP connect to the proxy itself failed
    #[error("Failed to connect to proxy {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Proxy answered CONNECT with a non-200 status; carries the reason phrase
    #[error("{0}")]
    Refused(String),

    /// Response status line could not be parsed
    #[error("Malformed proxy response: {0}")]
    MalformedResponse(String),

    /// I/O error while talking to the proxy
    #[error("Proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// UDP tunnel errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Failed to bind the inbound listener socket
    #[error("Failed to bind UDP listener on {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// I/O error on the inbound listener
    #[error("UDP I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl UdpError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `WsRouterError`
pub type Result<T> = std::result::Result<T, WsRouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification() {
        let config_err: WsRouterError = ConfigError::ValidationError("bad".into()).into();
        assert!(!config_err.is_recoverable());

        let upgrade_err: WsRouterError = UpgradeError::NotWebSocket.into();
        assert!(upgrade_err.is_recoverable());

        let bind_err: WsRouterError = UdpError::bind("0.0.0.0:9", "in use").into();
        assert!(!bind_err.is_recoverable());
    }

    #[test]
    fn test_proxy_refused_carries_reason_phrase() {
        let err = ProxyError::Refused("Forbidden".into());
        assert_eq!(err.to_string(), "Forbidden");
    }

    #[test]
    fn test_error_display() {
        let err = DialError::connect_failed("10.0.0.1:80", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:80"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: WsRouterError = io_err.into();
        assert!(err.is_recoverable());
    }
}
