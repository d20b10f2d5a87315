//! Relay Error Types
//!
//! Typed failures for the relay core. Engine-fatal errors (`Bind`) are returned
//! from `Engine::start`; everything else is contained to one connection or
//! session and only ever reaches the logs and the metrics.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::events::Direction;

/// Errors raised by the relay engines
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be bound; the engine stays stopped
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connection to the target failed; only that connection is dropped
    #[error("failed to connect to target {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to target {addr} timed out after {timeout:?}")]
    DialTimeout { addr: SocketAddr, timeout: Duration },

    /// Repeater negotiation did not produce a target
    #[error("repeater handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Read or write failure on an established pump
    #[error("{direction} transfer failed: {source}")]
    Transfer {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// A repeater session is already active for this local endpoint
    #[error("a repeater session is already registered for {0}")]
    RegistrationConflict(SocketAddr),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a repeater handshake ends in the `Failed` state
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer closed the connection during negotiation")]
    PeerClosed,

    #[error("no usable address after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },

    #[error("negotiation cancelled")]
    Cancelled,

    #[error("socket error during negotiation: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// True for errors that end the whole engine rather than a single connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::InvalidConfig(_))
    }
}

/// Result alias for relay core operations
pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let addr: SocketAddr = "127.0.0.1:4501".parse().unwrap();
        let bind = RelayError::Bind {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());

        let dial = RelayError::Dial {
            addr,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!dial.is_fatal());
        assert!(!RelayError::RegistrationConflict(addr).is_fatal());
        assert!(!RelayError::from(HandshakeError::PeerClosed).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = RelayError::from(HandshakeError::AttemptsExhausted { attempts: 10 });
        assert_eq!(
            err.to_string(),
            "repeater handshake failed: no usable address after 10 attempts"
        );

        let err = RelayError::Transfer {
            direction: Direction::Client,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(err.to_string().starts_with("Client transfer failed"));
    }
}
