//! Relay Engines
//!
//! An engine owns one listener and its accept loop. `ProxyEngine` relays every
//! connection to a fixed target; `RepeaterEngine` negotiates the target per
//! connection first.

mod lifecycle;
pub mod proxy;
pub mod repeater;

use std::future::Future;
use std::net::SocketAddr;

use crate::error::RelayResult;

pub use proxy::ProxyEngine;
pub use repeater::RepeaterEngine;

/// Start/stop contract shared by both relay modes
pub trait Engine: Send + Sync {
    /// Bind the listener and start accepting.
    ///
    /// Returns the bound address. Calling it on a running engine is a no-op
    /// that returns the current address; a bind failure leaves the engine
    /// stopped and is returned as `RelayError::Bind`.
    fn start(&self) -> impl Future<Output = RelayResult<SocketAddr>> + Send;

    /// Close the listener and cancel every session. No-op when stopped.
    fn stop(&self) -> impl Future<Output = RelayResult<()>> + Send;

    fn is_running(&self) -> bool;

    /// Bound listener address while running
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Connections currently holding a slot
    fn active_sessions(&self) -> usize;
}
