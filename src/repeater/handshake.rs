//! Repeater Handshake
//!
//! Per-connection negotiation of the real target endpoint. The repeater sends
//! the RFB-style greeting and waits for the client to answer with
//! `<ip-address>:<port>`, re-prompting on anything it cannot parse.

use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HandshakeError;

/// Greeting sent to clients that must negotiate their target
pub const GREETING: &[u8] = b"RFB 000.000\n";

/// Read attempts allowed while awaiting an address
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Replies this short (or shorter) are never treated as an address
const MIN_REPLY_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    GreetingSent,
    AwaitingAddress,
    Authenticated,
    Failed,
}

/// Negotiation state machine for one accepted repeater connection
#[derive(Debug)]
pub struct RepeaterHandshake {
    local: SocketAddr,
    peer: SocketAddr,
    fallback_target: SocketAddr,
    buffer_size: usize,
    max_attempts: usize,
    state: HandshakeState,
    attempts: usize,
}

impl RepeaterHandshake {
    pub fn new(
        local: SocketAddr,
        peer: SocketAddr,
        fallback_target: SocketAddr,
        buffer_size: usize,
        max_attempts: usize,
    ) -> Self {
        Self {
            local,
            peer,
            fallback_target,
            buffer_size: buffer_size.max(1),
            max_attempts,
            state: HandshakeState::Start,
            attempts: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Replies read so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// A peer on the relay's own address has no known target and must negotiate
    pub fn requires_negotiation(&self) -> bool {
        self.peer.ip() == self.local.ip()
    }

    /// Drive the handshake to a terminal state.
    ///
    /// Returns the target to dial on `Authenticated`. Any error leaves the
    /// machine in `Failed`; the caller closes the connection without dialing.
    pub async fn run<S>(
        &mut self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.negotiate(stream, cancel).await;

        match &result {
            Ok(target) => {
                self.state = HandshakeState::Authenticated;
                info!(peer = %self.peer, target = %target, "Repeater session authenticated");
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                warn!(peer = %self.peer, attempts = self.attempts, "Repeater handshake failed: {}", e);
            }
        }

        result
    }

    async fn negotiate<S>(
        &mut self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.requires_negotiation() {
            debug!(peer = %self.peer, "Peer carries a known target, skipping negotiation");
            return Ok(self.fallback_target);
        }

        self.send_greeting(stream, cancel).await?;
        self.state = HandshakeState::AwaitingAddress;

        let mut buffer = vec![0u8; self.buffer_size];

        while self.attempts < self.max_attempts {
            if cancel.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }

            let bytes_read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HandshakeError::Cancelled),
                read = stream.read(&mut buffer) => read?,
            };
            self.attempts += 1;

            if bytes_read == 0 {
                return Err(HandshakeError::PeerClosed);
            }

            let reply = String::from_utf8_lossy(&buffer[..bytes_read]);
            if let Some(target) = parse_address(&reply) {
                return Ok(target);
            }

            debug!(
                peer = %self.peer,
                attempt = self.attempts,
                "Rejected negotiation reply: {:?}",
                reply
            );

            if self.attempts < self.max_attempts {
                self.send_greeting(stream, cancel).await?;
                self.state = HandshakeState::AwaitingAddress;
            }
        }

        Err(HandshakeError::AttemptsExhausted {
            attempts: self.attempts,
        })
    }

    async fn send_greeting<S>(
        &mut self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), HandshakeError>
    where
        S: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HandshakeError::Cancelled),
            written = stream.write_all(GREETING) => written?,
        }
        self.state = HandshakeState::GreetingSent;
        Ok(())
    }
}

/// Parse a negotiation reply of the form `<ip>:<port>`.
///
/// The reply is split on its first `:`; surrounding whitespace (including the
/// line terminator) is ignored on both halves.
pub fn parse_address(reply: &str) -> Option<SocketAddr> {
    if reply.len() <= MIN_REPLY_LEN {
        return None;
    }

    let (host, port) = reply.split_once(':')?;
    let ip: IpAddr = host.trim().parse().ok()?;
    let port: u16 = port.trim().parse().ok()?;

    Some(SocketAddr::new(ip, port))
}
