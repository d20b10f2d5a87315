//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::repeater::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_SESSION_LIFETIME, MAX_SESSION_LIFETIME, MAX_SWEEP_INTERVAL,
};

/// Buffer size used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mode: RelayMode,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub repeater: RepeaterConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Which engine the binary runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Fixed client/target endpoint pair
    #[default]
    Proxy,
    /// Target negotiated per connection with the RFB-style handshake
    Repeater,
}

impl std::str::FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(RelayMode::Proxy),
            "repeater" => Ok(RelayMode::Repeater),
            other => Err(format!("unknown relay mode '{}', expected 'proxy' or 'repeater'", other)),
        }
    }
}

/// Listen/target endpoints of one relay.
///
/// Engines take their own copy at construction, so later changes to a
/// caller's value never reach a running engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub target_address: IpAddr,
    pub target_port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Server-wide tuning shared by both engines
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub event_buffer: usize,
}

/// Repeater negotiation and session lifetime
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepeaterConfig {
    pub max_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub session_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub log_payloads: bool,
    pub metrics_addr: Option<SocketAddr>,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl EndpointConfig {
    /// Endpoint pair with the default buffer size
    pub fn new(
        listen_address: IpAddr,
        listen_port: u16,
        target_address: IpAddr,
        target_port: u16,
    ) -> Self {
        Self {
            listen_address,
            listen_port,
            target_address,
            target_port,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn listen_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    pub fn target_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.target_address, self.target_port)
    }

    /// Checks the invariants an engine relies on
    pub fn validate(&self) -> RelayResult<()> {
        if self.buffer_size == 0 {
            return Err(RelayError::InvalidConfig(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl RepeaterConfig {
    /// Rejects values the session clock cannot represent
    pub fn validate(&self) -> RelayResult<()> {
        if self.max_attempts == 0 {
            return Err(RelayError::InvalidConfig(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.session_lifetime.is_zero() || self.session_lifetime > MAX_SESSION_LIFETIME {
            return Err(RelayError::InvalidConfig(format!(
                "session_lifetime must be greater than 0 and at most {}",
                humantime::format_duration(MAX_SESSION_LIFETIME)
            )));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval > MAX_SWEEP_INTERVAL {
            return Err(RelayError::InvalidConfig(format!(
                "sweep_interval must be greater than 0 and at most {}",
                humantime::format_duration(MAX_SWEEP_INTERVAL)
            )));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            4501,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            4502,
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            event_buffer: 1024,
        }
    }
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            session_lifetime: DEFAULT_SESSION_LIFETIME,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_payloads: false,
            metrics_addr: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            endpoint: EndpointConfig::default(),
            server: ServerConfig::default(),
            repeater: RepeaterConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}
