//! Static Proxy Engine

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

use super::lifecycle::{Accepted, Lifecycle};
use super::Engine;
use crate::config::{Config, EndpointConfig, ServerConfig};
use crate::error::RelayResult;
use crate::events::EventHub;
use crate::metrics::Metrics;
use crate::relay::{Session, SessionBridge};

/// Relays every accepted connection to one fixed target
pub struct ProxyEngine {
    endpoint: EndpointConfig,
    server: ServerConfig,
    events: EventHub,
    lifecycle: Lifecycle,
}

impl ProxyEngine {
    pub fn new(endpoint: EndpointConfig, events: EventHub) -> RelayResult<Self> {
        Self::with_server_config(endpoint, ServerConfig::default(), events)
    }

    pub fn from_config(config: &Config, events: EventHub) -> RelayResult<Self> {
        Self::with_server_config(config.endpoint.clone(), config.server.clone(), events)
    }

    fn with_server_config(
        endpoint: EndpointConfig,
        server: ServerConfig,
        events: EventHub,
    ) -> RelayResult<Self> {
        endpoint.validate()?;

        let lifecycle = Lifecycle::new(
            "proxy",
            endpoint.listen_endpoint(),
            server.max_connections,
            server.shutdown_timeout,
        );

        Ok(Self {
            endpoint,
            server,
            events,
            lifecycle,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.lifecycle.set_metrics(metrics);
        self
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    fn bridge(&self) -> SessionBridge {
        SessionBridge::new(
            self.endpoint.buffer_size,
            self.server.connect_timeout,
            self.events.clone(),
        )
        .with_metrics(self.lifecycle.metrics())
    }
}

impl Engine for ProxyEngine {
    async fn start(&self) -> RelayResult<SocketAddr> {
        let bridge = self.bridge();
        let target = self.endpoint.target_endpoint();

        self.lifecycle
            .start(
                move |accepted| {
                    let span = info_span!("proxy_connection", peer = %accepted.peer);
                    tokio::spawn(handle_connection(bridge.clone(), target, accepted).instrument(span));
                },
                |_| Vec::new(),
            )
            .await
    }

    async fn stop(&self) -> RelayResult<()> {
        self.lifecycle.stop().await
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

async fn handle_connection(bridge: SessionBridge, target: SocketAddr, accepted: Accepted) {
    let Accepted {
        stream,
        peer,
        slot: _slot,
        cancel,
        ..
    } = accepted;

    // Dial failures only cost this connection; the client socket closes on drop
    let target_stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Engine stopped before target connection was established");
            return;
        }
        dialed = bridge.connect_to_target(target) => match dialed {
            Ok(stream) => stream,
            Err(_) => return,
        }
    };

    let session = Arc::new(Session::new(peer, target, cancel));
    bridge.run(session, stream, target_stream).await;
}
