//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT (Ctrl+C on Windows) and stops engines within a
//! bounded time.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Upper bound for stopping one engine
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Completes on SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Stop an engine, giving up after the coordinator's timeout.
    ///
    /// Engines already bound their own drain wait by `shutdown_timeout`; this
    /// bounds the whole stop, including awaiting the accept loop.
    pub async fn shutdown_engine<E: Engine>(&self, engine: &E) -> Result<()> {
        info!("Initiating graceful shutdown of relay engine");
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, engine.stop()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} sessions still active",
                    start_time.elapsed(),
                    engine.active_sessions()
                );
                return Ok(());
            }
        }

        info!("Relay engine shut down in {:?}", start_time.elapsed());
        Ok(())
    }
}
