//! Event Types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which peer the bytes were read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Read from the accepted client, forwarded to the target
    Client,
    /// Read from the target, forwarded back to the client
    Server,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Client => "Client",
            Direction::Server => "Server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successful read on a pump.
///
/// `payload` holds exactly the `byte_count` bytes returned by the read; it is
/// never trimmed, so binary data with trailing zero bytes is reported as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub direction: Direction,
    pub byte_count: usize,
    pub payload: Bytes,
}

impl TransferEvent {
    pub fn new(direction: Direction, payload: Bytes) -> Self {
        Self {
            direction,
            byte_count: payload.len(),
            payload,
        }
    }
}

/// Everything the relay reports to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Raised after a read, before the bytes are forwarded
    BytesTransferred(TransferEvent),
    /// Raised after client bytes were written to the target
    ClientToServer(usize),
    /// Raised after target bytes were written to the client
    ServerToClient(usize),
}

impl RelayEvent {
    /// Completion event for a forwarded write in the given direction
    pub fn forwarded(direction: Direction, byte_count: usize) -> Self {
        match direction {
            Direction::Client => RelayEvent::ClientToServer(byte_count),
            Direction::Server => RelayEvent::ServerToClient(byte_count),
        }
    }
}

/// Receives relay notifications.
///
/// Every method defaults to a no-op so observers only implement what they
/// care about. Calls happen on the observer's own dispatch task, never on a
/// pump, so a slow implementation only delays itself.
pub trait TransferObserver: Send + Sync + 'static {
    fn on_bytes_transferred(&self, _direction: Direction, _payload: &[u8]) {}

    fn on_client_to_server(&self, _byte_count: usize) {}

    fn on_server_to_client(&self, _byte_count: usize) {}

    /// Called when the dispatcher fell behind and `skipped` events were dropped
    fn on_lagged(&self, _skipped: u64) {}
}

/// Route one event to the matching observer callback
pub(crate) fn dispatch(observer: &dyn TransferObserver, event: &RelayEvent) {
    match event {
        RelayEvent::BytesTransferred(transfer) => {
            observer.on_bytes_transferred(transfer.direction, &transfer.payload)
        }
        RelayEvent::ClientToServer(n) => observer.on_client_to_server(*n),
        RelayEvent::ServerToClient(n) => observer.on_server_to_client(*n),
    }
}
