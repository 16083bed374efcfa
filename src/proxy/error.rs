//! Proxy error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the proxy facade and its engines.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The frontend/backend pair cannot be proxied.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// What is wrong with the pair.
        message: String,
    },

    /// The frontend socket could not be bound or listened on.
    #[error("failed to bind frontend {addr}: {source}")]
    BindFailure {
        /// The requested frontend address.
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The backend could not be dialed for one TCP session.
    #[error("failed to dial backend {addr}: {source}")]
    DialFailure {
        /// The backend address.
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A TCP session failed mid-transfer.
    #[error("relay failed: {0}")]
    RelayError(#[source] std::io::Error),

    /// A datagram could not be forwarded to the backend.
    #[error("failed to send datagram to {addr}: {source}")]
    SendFailure {
        /// The backend address.
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The proxy has been closed.
    #[error("proxy is shut down")]
    ShutdownInProgress,

    /// `run` was called on a proxy that is already running.
    #[error("proxy is already running")]
    AlreadyRunning,
}

impl ProxyError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = ProxyError::DialFailure {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("failed to dial backend 127.0.0.1:9"));
        assert!(std::error::Error::source(&err).is_some());

        let err = ProxyError::invalid("tcp frontend with udp backend");
        assert_eq!(
            err.to_string(),
            "invalid configuration: tcp frontend with udp backend"
        );
    }
}
