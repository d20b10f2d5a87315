//! Event Hub
//!
//! Fan-out of relay events to any number of observers. Pumps publish into a
//! broadcast channel and never wait on subscribers: with nobody listening an
//! event is dropped, and a subscriber that falls more than `capacity` events
//! behind loses the oldest ones instead of stalling the relay.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::{dispatch, RelayEvent, TransferObserver};

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cloneable publisher/registration point for relay events
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventHub {
    /// Create a hub buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; a no-op without subscribers.
    pub fn emit(&self, event: RelayEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        // Only fails when the last receiver went away between the check and the send
        let _ = self.tx.send(event);
    }

    /// Raw receiver for callers that want to consume events themselves
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers, observers included
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Attach an observer. Its callbacks run on a dedicated task that lives
    /// until every clone of the hub has been dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, observer: Arc<dyn TransferObserver>) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => dispatch(observer.as_ref(), &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Observer fell behind, dropped relay events");
                        observer.on_lagged(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event hub closed, observer task exiting");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Direction, TransferEvent};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::{timeout, Duration};

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<(Direction, Vec<u8>)>>,
        up: AtomicUsize,
        down: AtomicUsize,
    }

    impl TransferObserver for Recorder {
        fn on_bytes_transferred(&self, direction: Direction, payload: &[u8]) {
            self.payloads.lock().unwrap().push((direction, payload.to_vec()));
        }

        fn on_client_to_server(&self, byte_count: usize) {
            self.up.fetch_add(byte_count, Ordering::SeqCst);
        }

        fn on_server_to_client(&self, byte_count: usize) {
            self.down.fetch_add(byte_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let hub = EventHub::new(4);
        assert_eq!(hub.subscriber_count(), 0);

        // Must not panic or block
        hub.emit(RelayEvent::ClientToServer(5));
    }

    #[tokio::test]
    async fn test_observer_receives_all_event_kinds() {
        let hub = EventHub::new(16);
        let recorder = Arc::new(Recorder::default());
        let _task = hub.register(recorder.clone());

        hub.emit(RelayEvent::BytesTransferred(TransferEvent::new(
            Direction::Client,
            Bytes::from_static(b"ab\0\0"),
        )));
        hub.emit(RelayEvent::ClientToServer(4));
        hub.emit(RelayEvent::ServerToClient(7));

        timeout(Duration::from_secs(2), async {
            while recorder.down.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("observer did not see events");

        let payloads = recorder.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], (Direction::Client, b"ab\0\0".to_vec()));
        assert_eq!(recorder.up.load(Ordering::SeqCst), 4);
        assert_eq!(recorder.down.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_observer_task_ends_with_hub() {
        let hub = EventHub::new(4);
        let task = hub.register(Arc::new(Recorder::default()));
        drop(hub);

        assert!(timeout(Duration::from_secs(2), task).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block_emit() {
        let hub = EventHub::new(2);
        let mut rx = hub.subscribe();

        for n in 0..10 {
            hub.emit(RelayEvent::ClientToServer(n));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
