//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One accepted client connection paired with its outbound target connection.
///
/// The socket handles themselves are owned by the session's two pumps; the
/// session keeps the bookkeeping and the cancellation handle both pumps obey.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub created_at: SystemTime,
    start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    cancel: CancellationToken,
}

/// Statistics for a finished (or running) session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub created_at: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl Session {
    /// Create a session with a fresh id, governed by `cancel`
    pub fn new(client_addr: SocketAddr, target_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            client_addr,
            target_addr,
            cancel,
        )
    }

    /// Create a session reusing an id issued elsewhere (e.g. by the repeater registry)
    pub fn with_id(
        session_id: String,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, target_addr
        );

        Self {
            session_id,
            client_addr,
            target_addr,
            created_at: SystemTime::now(),
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            cancel,
        }
    }

    /// Bytes forwarded client -> target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes forwarded target -> client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Handle the session's pumps watch
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask both pumps to stop; they exit on their next I/O attempt
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            created_at: self.created_at,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            "Relay session completed"
        );
    }
}
