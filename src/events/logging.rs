//! Logging Observer

use tracing::{debug, info};

use super::{Direction, TransferObserver};

/// Writes every relay event to the tracing log.
///
/// Payloads are rendered lossily as text, the way an operator watching a
/// plaintext protocol expects to read them.
#[derive(Debug, Default, Clone)]
pub struct LoggingObserver {
    show_payloads: bool,
}

impl LoggingObserver {
    pub fn new(show_payloads: bool) -> Self {
        Self { show_payloads }
    }
}

impl TransferObserver for LoggingObserver {
    fn on_bytes_transferred(&self, direction: Direction, payload: &[u8]) {
        if self.show_payloads {
            info!(
                direction = %direction,
                bytes = payload.len(),
                "{} sent {}",
                direction,
                String::from_utf8_lossy(payload)
            );
        } else {
            debug!(direction = %direction, bytes = payload.len(), "Bytes read");
        }
    }

    fn on_client_to_server(&self, byte_count: usize) {
        info!("Client sent {} bytes to Server", byte_count);
    }

    fn on_server_to_client(&self, byte_count: usize) {
        info!("Server sent {} bytes to Client", byte_count);
    }
}
