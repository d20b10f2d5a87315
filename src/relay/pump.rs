//! Connection Pump
//!
//! One direction of a relayed session: read from `source`, report, write the
//! same bytes to `destination`, repeat until the peer closes, an I/O call
//! fails or the session is cancelled.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::events::{Direction, EventHub, RelayEvent, TransferEvent};

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpEnd {
    /// Zero-byte read: the source closed gracefully
    PeerClosed,
    /// The session's cancellation token fired
    Cancelled,
    /// Read or write failure; the peer has to reconnect
    Failed(RelayError),
}

/// Completion report a pump hands back to its session
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    /// Bytes successfully written to the destination
    pub bytes: u64,
    pub end: PumpEnd,
}

impl PumpReport {
    pub fn is_clean(&self) -> bool {
        !matches!(self.end, PumpEnd::Failed(_))
    }
}

/// Unidirectional copy loop with per-read event reporting
pub struct ConnectionPump<R, W> {
    source: R,
    destination: W,
    direction: Direction,
    buffer_size: usize,
    cancel: CancellationToken,
    events: EventHub,
}

impl<R, W> ConnectionPump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        source: R,
        destination: W,
        direction: Direction,
        buffer_size: usize,
        cancel: CancellationToken,
        events: EventHub,
    ) -> Self {
        Self {
            source,
            destination,
            direction,
            buffer_size: buffer_size.max(1),
            cancel,
            events,
        }
    }

    /// Run until termination. At most one read or write may complete after
    /// cancellation is requested; nothing is started once it is observed.
    pub async fn run(mut self) -> PumpReport {
        let direction = self.direction;
        let mut buf = vec![0u8; self.buffer_size];
        let mut bytes: u64 = 0;

        let end = loop {
            if self.cancel.is_cancelled() {
                break PumpEnd::Cancelled;
            }

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PumpEnd::Cancelled,
                read = self.source.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    // Propagate the half-close before the session is torn down
                    let _ = self.destination.shutdown().await;
                    break PumpEnd::PeerClosed;
                }
                Ok(n) => n,
                Err(source) => break PumpEnd::Failed(RelayError::Transfer { direction, source }),
            };

            if self.events.subscriber_count() > 0 {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                self.events
                    .emit(RelayEvent::BytesTransferred(TransferEvent::new(direction, payload)));
            }

            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PumpEnd::Cancelled,
                written = self.destination.write_all(&buf[..n]) => written,
            };

            if let Err(source) = written {
                break PumpEnd::Failed(RelayError::Transfer { direction, source });
            }

            bytes += n as u64;
            trace!(direction = %direction, bytes = n, "Forwarded chunk");
            self.events.emit(RelayEvent::forwarded(direction, n));
        };

        debug!(direction = %direction, bytes, end = ?end, "Pump finished");

        PumpReport {
            direction,
            bytes,
            end,
        }
    }
}
