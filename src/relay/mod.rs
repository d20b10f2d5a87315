//! Data Relay Module
//!
//! Handles bidirectional data relay between client and target.

pub mod bridge;
pub mod pump;
pub mod session;

pub use bridge::SessionBridge;
pub use pump::{ConnectionPump, PumpEnd, PumpReport};
pub use session::{Session, SessionStats};
