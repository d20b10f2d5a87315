//! Session Bridge
//!
//! Opens the outbound leg of a session and runs the two pumps that join it to
//! the accepted client connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::pump::{ConnectionPump, PumpEnd, PumpReport};
use super::session::{Session, SessionStats};
use crate::error::{RelayError, RelayResult};
use crate::events::{Direction, EventHub};
use crate::metrics::Metrics;

/// Dials targets and pumps bytes for sessions
#[derive(Clone)]
pub struct SessionBridge {
    buffer_size: usize,
    connect_timeout: Duration,
    events: EventHub,
    metrics: Option<Arc<Metrics>>,
}

impl SessionBridge {
    pub fn new(buffer_size: usize, connect_timeout: Duration, events: EventHub) -> Self {
        Self {
            buffer_size,
            connect_timeout,
            events,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Establish the outbound connection to a target
    pub async fn connect_to_target(&self, addr: SocketAddr) -> RelayResult<TcpStream> {
        debug!("Attempting to connect to target: {}", addr);

        let result = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(RelayError::Dial { addr, source }),
            Err(_) => Err(RelayError::DialTimeout {
                addr,
                timeout: self.connect_timeout,
            }),
        };

        match &result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for target {}: {}", addr, e);
                }
                info!("Connected to target: {}", addr);
            }
            Err(e) => {
                warn!("Failed to connect to target {}: {}", addr, e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_dial_failure();
                }
            }
        }

        result
    }

    /// Relay data bidirectionally until either pump ends.
    ///
    /// Whichever pump finishes first cancels the session, which stops its
    /// sibling; the call returns only after both pumps have terminated and
    /// both sockets are closed.
    pub async fn run(&self, session: Arc<Session>, client: TcpStream, target: TcpStream) -> SessionStats {
        info!(
            "Starting bidirectional data relay for session {} ({} <-> {})",
            session.session_id, session.client_addr, session.target_addr
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_session_started();
        }

        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target.into_split();

        let upstream = self.spawn_pump(&session, client_read, target_write, Direction::Client);
        let downstream = self.spawn_pump(&session, target_read, client_write, Direction::Server);

        let (upstream, downstream) = tokio::join!(upstream, downstream);

        for joined in [upstream, downstream] {
            match joined {
                Ok(report) => self.record_report(&session, report),
                Err(e) => {
                    // The drop guard already cancelled the session
                    error!(session_id = %session.session_id, "Pump task failed: {}", e);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_session_ended(session.duration());
        }

        session.log_stats();
        session.to_stats()
    }

    fn spawn_pump<R, W>(
        &self,
        session: &Session,
        source: R,
        destination: W,
        direction: Direction,
    ) -> tokio::task::JoinHandle<PumpReport>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = session.cancel_token();
        let pump = ConnectionPump::new(
            source,
            destination,
            direction,
            self.buffer_size,
            cancel.clone(),
            self.events.clone(),
        );

        tokio::spawn(async move {
            let _guard = cancel.drop_guard();
            pump.run().await
        })
    }

    fn record_report(&self, session: &Session, report: PumpReport) {
        match report.direction {
            Direction::Client => session.add_bytes_up(report.bytes),
            Direction::Server => session.add_bytes_down(report.bytes),
        }

        match report.end {
            PumpEnd::PeerClosed => {
                debug!(session_id = %session.session_id, direction = %report.direction, "Peer closed connection");
            }
            PumpEnd::Cancelled => {
                debug!(session_id = %session.session_id, direction = %report.direction, "Pump cancelled");
            }
            PumpEnd::Failed(e) => {
                warn!(session_id = %session.session_id, "Relay pump failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_dial_failure_is_typed() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let metrics = Arc::new(Metrics::new().unwrap());
        let bridge = SessionBridge::new(1024, Duration::from_secs(2), EventHub::default())
            .with_metrics(Some(metrics.clone()));

        let err = bridge.connect_to_target(addr).await.unwrap_err();
        assert!(matches!(err, RelayError::Dial { .. } | RelayError::DialTimeout { .. }));
        assert_eq!(metrics.dial_failures(), 1);
    }

    #[tokio::test]
    async fn test_relay_both_directions_and_teardown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, client_side) = socket_pair(&listener).await;
        let (target_side, mut target) = socket_pair(&listener).await;

        let session = Arc::new(Session::new(
            client_side.peer_addr().unwrap(),
            target_side.peer_addr().unwrap(),
            CancellationToken::new(),
        ));
        let bridge = SessionBridge::new(1024, Duration::from_secs(2), EventHub::default());
        let run = tokio::spawn({
            let session = session.clone();
            async move { bridge.run(session, client_side, target_side).await }
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Closing one side tears down the whole session
        drop(client);
        let stats = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("session did not shut down")
            .unwrap();

        assert_eq!(stats.bytes_up, 4);
        assert_eq!(stats.bytes_down, 5);
        assert!(session.is_cancelled());

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), target.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
