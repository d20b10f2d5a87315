//! Repeater Engine
//!
//! Every accepted connection is registered under its local endpoint, then
//! negotiates its target with the RFB-style handshake before relaying. A
//! sweeper task closes sessions that outlive their lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::lifecycle::{Accepted, Lifecycle};
use super::Engine;
use crate::config::{Config, EndpointConfig, RepeaterConfig, ServerConfig};
use crate::error::{HandshakeError, RelayError, RelayResult};
use crate::events::EventHub;
use crate::metrics::Metrics;
use crate::relay::{Session, SessionBridge};
use crate::repeater::registry::deadline_after;
use crate::repeater::{RepeaterHandshake, RepeaterSession, SessionRegistry};

pub struct RepeaterEngine {
    endpoint: EndpointConfig,
    server: ServerConfig,
    repeater: RepeaterConfig,
    events: EventHub,
    registry: Arc<SessionRegistry>,
    lifecycle: Lifecycle,
}

/// Per-connection settings shared by every session task
#[derive(Clone)]
struct SessionContext {
    bridge: SessionBridge,
    registry: Arc<SessionRegistry>,
    metrics: Option<Arc<Metrics>>,
    fallback_target: SocketAddr,
    max_attempts: usize,
}

impl RepeaterEngine {
    pub fn new(endpoint: EndpointConfig, events: EventHub) -> RelayResult<Self> {
        Self::with_settings(
            endpoint,
            ServerConfig::default(),
            RepeaterConfig::default(),
            events,
        )
    }

    pub fn from_config(config: &Config, events: EventHub) -> RelayResult<Self> {
        Self::with_settings(
            config.endpoint.clone(),
            config.server.clone(),
            config.repeater.clone(),
            events,
        )
    }

    /// Engine with explicit server and repeater tuning
    pub fn with_settings(
        endpoint: EndpointConfig,
        server: ServerConfig,
        repeater: RepeaterConfig,
        events: EventHub,
    ) -> RelayResult<Self> {
        endpoint.validate()?;
        repeater.validate()?;

        let lifecycle = Lifecycle::new(
            "repeater",
            endpoint.listen_endpoint(),
            server.max_connections,
            server.shutdown_timeout,
        );

        Ok(Self {
            endpoint,
            server,
            repeater,
            events,
            registry: Arc::new(SessionRegistry::new()),
            lifecycle,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.lifecycle.set_metrics(metrics);
        self
    }

    /// Live sessions of this engine
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn context(&self) -> SessionContext {
        let metrics = self.lifecycle.metrics();
        SessionContext {
            bridge: SessionBridge::new(
                self.endpoint.buffer_size,
                self.server.connect_timeout,
                self.events.clone(),
            )
            .with_metrics(metrics.clone()),
            registry: Arc::clone(&self.registry),
            metrics,
            fallback_target: self.endpoint.target_endpoint(),
            max_attempts: self.repeater.max_attempts,
        }
    }
}

impl Engine for RepeaterEngine {
    async fn start(&self) -> RelayResult<SocketAddr> {
        let context = self.context();
        let lifetime = self.repeater.session_lifetime;
        let sweep_interval = self.repeater.sweep_interval;
        let registry = Arc::clone(&self.registry);
        let metrics = self.lifecycle.metrics();

        self.lifecycle
            .start(
                move |accepted| register_connection(&context, lifetime, accepted),
                move |shutdown| {
                    vec![spawn_sweeper(
                        registry,
                        metrics,
                        sweep_interval,
                        shutdown.clone(),
                    )]
                },
            )
            .await
    }

    async fn stop(&self) -> RelayResult<()> {
        let result = self.lifecycle.stop().await;
        let leftover = self.registry.clear();
        if leftover > 0 {
            debug!("Cleared {} repeater sessions on stop", leftover);
        }
        result
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    fn active_sessions(&self) -> usize {
        self.lifecycle.active_sessions()
    }
}

/// Runs inline in the accept loop so registration order follows accept order
fn register_connection(context: &SessionContext, lifetime: std::time::Duration, accepted: Accepted) {
    let session = RepeaterSession::new(accepted.local, accepted.peer, lifetime, accepted.cancel.clone());

    if !context.registry.try_register(session.clone()) {
        let conflict = RelayError::RegistrationConflict(accepted.local);
        warn!(peer = %accepted.peer, "Rejecting connection: {}", conflict);
        if let Some(metrics) = &context.metrics {
            metrics.record_registration_conflict();
        }
        return;
    }

    let span = info_span!("repeater_session", session_id = %session.session_id, peer = %accepted.peer);
    tokio::spawn(run_session(context.clone(), session, accepted).instrument(span));
}

async fn run_session(context: SessionContext, entry: RepeaterSession, accepted: Accepted) {
    let Accepted {
        mut stream,
        peer,
        local,
        slot: _slot,
        cancel,
    } = accepted;

    let mut handshake = RepeaterHandshake::new(
        local,
        peer,
        context.fallback_target,
        context.bridge.buffer_size(),
        context.max_attempts,
    );

    let outcome = match handshake.run(&mut stream, &cancel).await {
        Ok(target) => connect(&context, &entry, target, &cancel).await,
        Err(e) => {
            if let Some(metrics) = &context.metrics {
                metrics.record_handshake_failure();
            }
            Err(RelayError::from(e))
        }
    };

    match outcome {
        Ok((target, target_stream)) => {
            let session = Arc::new(Session::with_id(
                entry.session_id.clone(),
                peer,
                target,
                cancel,
            ));
            context.bridge.run(session, stream, target_stream).await;
        }
        Err(e) => {
            debug!("Closing repeater connection without relaying: {}", e);
        }
    }

    context.registry.remove_session(&local, &entry.session_id);
}

async fn connect(
    context: &SessionContext,
    entry: &RepeaterSession,
    target: SocketAddr,
    cancel: &CancellationToken,
) -> RelayResult<(SocketAddr, tokio::net::TcpStream)> {
    if !context
        .registry
        .mark_authenticated(&entry.local_endpoint, &entry.session_id, target)
    {
        // Swept while negotiating
        return Err(RelayError::Handshake(HandshakeError::Cancelled));
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(RelayError::Handshake(HandshakeError::Cancelled))
        }
        dialed = context.bridge.connect_to_target(target) => {
            dialed.map(|stream| (target, stream))
        }
    }
}

/// Close sessions at their expiry, waking no later than `sweep_interval`
fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    metrics: Option<Arc<Metrics>>,
    sweep_interval: std::time::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting repeater session sweeper");

        loop {
            let now = Instant::now();
            let interval_end = deadline_after(now, sweep_interval);
            let next_sweep = match registry.next_expiry() {
                Some(expiry) => expiry.min(interval_end),
                None => interval_end,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_sweep.into()) => {}
                // A new session may expire before the current deadline
                _ = registry.registered() => continue,
            }

            let expired = registry.sweep_expired(Instant::now());
            if !expired.is_empty() {
                info!("Closed {} expired repeater sessions", expired.len());
                if let Some(metrics) = &metrics {
                    metrics.record_expired_sessions(expired.len());
                }
            }
        }

        debug!("Repeater session sweeper stopped");
    })
}
