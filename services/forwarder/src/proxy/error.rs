//! Error types for the forwarding core.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Forwarding errors with standardized reason codes.
///
/// I/O causes are shared behind an `Arc` so the error can be cloned into
/// every notification that carries it without reinterpreting the original.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// The listen port could not be bound.
    #[error("bind_failure: port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    /// The listening socket failed after it was ready.
    #[error("listener_failed: {0}")]
    Listener(#[source] Arc<io::Error>),

    /// Graceful end-of-stream or cancellation on a relay leg.
    #[error("connection closed")]
    ConnectionClosed,

    /// Read, write or connect failure on a relay socket.
    #[error("transport_error: {0}")]
    Transport(#[source] Arc<io::Error>),

    /// Health probe could not reach the target.
    #[error("target_unreachable: 127.0.0.1:{port}: {reason}")]
    TargetUnreachable { port: u16, reason: String },

    /// Retry budget exhausted; requires an explicit start to recover.
    #[error("server_unavailable: gave up after {attempts} restart attempts")]
    ServerUnavailable { attempts: u32 },

    /// Port 0 was supplied where a concrete port is required.
    #[error("invalid_port: {0}")]
    InvalidPort(u16),
}

impl ProxyError {
    pub fn transport(err: io::Error) -> Self {
        ProxyError::Transport(Arc::new(err))
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind_failure",
            ProxyError::Listener(_) => "listener_failed",
            ProxyError::ConnectionClosed => "connection_closed",
            ProxyError::Transport(_) => "transport_error",
            ProxyError::TargetUnreachable { .. } => "target_unreachable",
            ProxyError::ServerUnavailable { .. } => "server_unavailable",
            ProxyError::InvalidPort(_) => "invalid_port",
        }
    }

    /// Whether the error ends automatic recovery for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProxyError::ServerUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let bind = ProxyError::Bind {
            port: 8080,
            source: Arc::new(io::Error::from(io::ErrorKind::AddrInUse)),
        };
        assert_eq!(bind.reason_code(), "bind_failure");
        assert!(bind.to_string().starts_with("bind_failure: port 8080"));

        let gave_up = ProxyError::ServerUnavailable { attempts: 3 };
        assert_eq!(gave_up.reason_code(), "server_unavailable");
        assert!(gave_up.is_terminal());
        assert!(!ProxyError::ConnectionClosed.is_terminal());
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let err = ProxyError::transport(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"));
        let cloned = err.clone();
        match cloned {
            ProxyError::Transport(source) => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
