//! Resource Management
//!
//! Connection limits for the relay engines. Every accepted connection holds a
//! slot for its whole lifetime, which also gives `stop` a way to wait for
//! in-flight sessions to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Tracks and enforces the concurrent connection limit
#[derive(Debug)]
pub struct ResourceManager {
    max_connections: usize,
    /// Connection semaphore for limiting concurrent connections
    connection_semaphore: Arc<Semaphore>,
    stats: ResourceStats,
}

#[derive(Debug, Default)]
struct ResourceStats {
    peak_connections: AtomicUsize,
    total_connections_created: AtomicUsize,
    total_connections_rejected: AtomicUsize,
}

impl ResourceManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a connection slot; `None` when the limit is reached
    pub fn acquire_connection_slot(&self) -> Option<ConnectionSlot> {
        match Arc::clone(&self.connection_semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats
                    .total_connections_created
                    .fetch_add(1, Ordering::Relaxed);

                let current = self.active_connections();
                self.stats.peak_connections.fetch_max(current, Ordering::Relaxed);

                debug!("Acquired connection slot, active connections: {}", current);
                Some(ConnectionSlot { _permit: permit })
            }
            Err(_) => {
                self.stats
                    .total_connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection limit reached ({}), rejecting connection",
                    self.max_connections
                );
                None
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.connection_semaphore.available_permits()
    }

    /// Wait for all slots to be released, giving up after `timeout`.
    ///
    /// Returns the number of connections still active.
    pub async fn wait_until_idle(&self, timeout: Duration) -> usize {
        let start_time = Instant::now();
        let mut last_count = self.active_connections();

        if last_count > 0 {
            info!(
                "Waiting for {} active connections to close (timeout: {:?})",
                last_count, timeout
            );
        }

        while last_count > 0 && start_time.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(10)).await;

            let current_count = self.active_connections();
            if current_count != last_count {
                debug!("Active connections: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        if last_count > 0 {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                start_time.elapsed(),
                last_count
            );
        }

        last_count
    }

    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_connections: self.active_connections(),
            peak_connections: self.stats.peak_connections.load(Ordering::Relaxed),
            total_connections_created: self.stats.total_connections_created.load(Ordering::Relaxed),
            total_connections_rejected: self
                .stats
                .total_connections_rejected
                .load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Connection slot that automatically releases when dropped
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Resource usage statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsageStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_created: usize,
    pub total_connections_rejected: usize,
    pub max_connections: usize,
}
