//! Listener lifecycle and accept loop shared by both engines

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::metrics::Metrics;
use crate::resource::{ConnectionSlot, ResourceManager};

/// A connection handed from the accept loop to an engine
pub(crate) struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Server-side endpoint of the accepted socket
    pub local: SocketAddr,
    pub slot: ConnectionSlot,
    /// Child of the engine run's token; cancelled by `stop`
    pub cancel: CancellationToken,
}

struct Running {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the listener of one engine instance between `start` and `stop`
pub(crate) struct Lifecycle {
    name: &'static str,
    listen: SocketAddr,
    shutdown_timeout: Duration,
    resources: Arc<ResourceManager>,
    metrics: Option<Arc<Metrics>>,
    running: Arc<AtomicBool>,
    bound: Mutex<Option<SocketAddr>>,
    state: tokio::sync::Mutex<Option<Running>>,
}

impl Lifecycle {
    pub fn new(
        name: &'static str,
        listen: SocketAddr,
        max_connections: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name,
            listen,
            shutdown_timeout,
            resources: Arc::new(ResourceManager::new(max_connections)),
            metrics: None,
            running: Arc::new(AtomicBool::new(false)),
            bound: Mutex::new(None),
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_sessions(&self) -> usize {
        self.resources.active_connections()
    }

    /// Bind and spawn the accept loop plus any background tasks.
    ///
    /// `handler` runs inline in the accept loop for every connection that got
    /// a slot; it must not block and spawns its own session task.
    pub async fn start<H, B>(&self, handler: H, background: B) -> RelayResult<SocketAddr>
    where
        H: Fn(Accepted) + Send + Sync + 'static,
        B: FnOnce(&CancellationToken) -> Vec<JoinHandle<()>> + Send,
    {
        let mut state = self.state.lock().await;

        if state.is_some() {
            if let (true, Some(addr)) = (self.is_running(), self.local_addr()) {
                debug!("{} engine already running on {}", self.name, addr);
                return Ok(addr);
            }
            // Accept loop died on its own; release the previous run first
            if let Some(previous) = state.take() {
                self.teardown(previous).await;
            }
        }

        info!("Binding {} listener to {}", self.name, self.listen);
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("{} engine listening on {}", self.name, local_addr);

        let shutdown = CancellationToken::new();
        let mut tasks = background(&shutdown);

        self.running.store(true, Ordering::SeqCst);
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        tasks.push(tokio::spawn(accept_loop(
            self.name,
            listener,
            handler,
            Arc::clone(&self.resources),
            self.metrics.clone(),
            shutdown.clone(),
            Arc::clone(&self.running),
        )));

        *state = Some(Running { shutdown, tasks });
        Ok(local_addr)
    }

    /// Stop accepting, cancel every session and wait for them to drain
    pub async fn stop(&self) -> RelayResult<()> {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            debug!("{} engine is not running", self.name);
            return Ok(());
        };

        info!("Stopping {} engine", self.name);
        self.teardown(running).await;

        let remaining = self.resources.wait_until_idle(self.shutdown_timeout).await;
        if remaining == 0 {
            info!("{} engine stopped", self.name);
        } else {
            warn!(
                "{} engine stopped with {} sessions still closing",
                self.name, remaining
            );
        }

        let stats = self.resources.get_stats();
        info!(
            peak = stats.peak_connections,
            accepted = stats.total_connections_created,
            rejected = stats.total_connections_rejected,
            limit = stats.max_connections,
            "{} engine connection totals",
            self.name
        );
        Ok(())
    }

    async fn teardown(&self, running: Running) {
        self.running.store(false, Ordering::SeqCst);
        running.shutdown.cancel();

        for task in running.tasks {
            if let Err(e) = task.await {
                error!("{} engine task failed: {}", self.name, e);
            }
        }

        // The accept task owned the listener, so the port is free again here
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

async fn accept_loop<H>(
    name: &'static str,
    listener: TcpListener,
    handler: H,
    resources: Arc<ResourceManager>,
    metrics: Option<Arc<Metrics>>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
) where
    H: Fn(Accepted) + Send + Sync + 'static,
{
    info!("Starting {} connection acceptance loop", name);
    let _running = RunningFlag(running);

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Shutdown requested, stopping connection acceptance");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    error!("Error accepting connection, stopping {} listener: {}", name, e);
                    break;
                }
            }
        };

        debug!("Accepted connection from {}", peer);
        if let Some(metrics) = &metrics {
            metrics.record_connection_accepted();
        }

        let Some(slot) = resources.acquire_connection_slot() else {
            if let Some(metrics) = &metrics {
                metrics.record_connection_rejected();
            }
            continue;
        };

        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection from {}: no local address: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        handler(Accepted {
            stream,
            peer,
            local,
            slot,
            cancel: shutdown.child_token(),
        });
    }

    info!("{} connection acceptance loop stopped", name);
}

/// Clears the running flag when the accept loop ends, panics included
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
