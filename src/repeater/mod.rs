//! Repeater Module
//!
//! RFB-style target negotiation and the registry of live repeater sessions.

pub mod handshake;
pub mod registry;

pub use handshake::{parse_address, HandshakeState, RepeaterHandshake, DEFAULT_MAX_ATTEMPTS, GREETING};
pub use registry::{
    RepeaterSession, SessionRegistry, DEFAULT_SESSION_LIFETIME, MAX_SESSION_LIFETIME,
    MAX_SWEEP_INTERVAL,
};
