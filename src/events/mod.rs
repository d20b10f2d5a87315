//! Relay Events
//!
//! Observer contract for transfer notifications and the hub that dispatches them.

pub mod hub;
pub mod logging;
pub mod types;

pub use hub::{EventHub, DEFAULT_EVENT_CAPACITY};
pub use logging::LoggingObserver;
pub use types::{Direction, RelayEvent, TransferEvent, TransferObserver};
