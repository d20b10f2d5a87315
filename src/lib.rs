//! NRelay Library
//!
//! TCP relay with two modes: a static proxy forwarding every connection to a
//! fixed target, and an RFB-style repeater that negotiates the target per
//! connection before relaying.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod relay;
pub mod repeater;
pub mod resource;
pub mod shutdown;

pub use config::{Config, EndpointConfig, RelayMode};
pub use engine::{Engine, ProxyEngine, RepeaterEngine};
pub use error::{HandshakeError, RelayError, RelayResult};
pub use events::{Direction, EventHub, TransferObserver};
pub use resource::ResourceManager;
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level code
pub type Result<T> = anyhow::Result<T>;
