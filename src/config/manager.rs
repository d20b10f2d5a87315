//! Configuration Manager

use super::{Config, RelayMode};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Largest accepted per-read buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(mode) = std::env::var("NRELAY_MODE") {
            config.mode = mode
                .parse::<RelayMode>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid NRELAY_MODE: {}", mode))?;
        }

        if let Ok(addr) = std::env::var("NRELAY_LISTEN_ADDRESS") {
            config.endpoint.listen_address = addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid NRELAY_LISTEN_ADDRESS: {}", addr))?;
        }

        if let Ok(port) = std::env::var("NRELAY_LISTEN_PORT") {
            config.endpoint.listen_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NRELAY_LISTEN_PORT: {}", port))?;
        }

        if let Ok(addr) = std::env::var("NRELAY_TARGET_ADDRESS") {
            config.endpoint.target_address = addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid NRELAY_TARGET_ADDRESS: {}", addr))?;
        }

        if let Ok(port) = std::env::var("NRELAY_TARGET_PORT") {
            config.endpoint.target_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid NRELAY_TARGET_PORT: {}", port))?;
        }

        if let Ok(buffer_size) = std::env::var("NRELAY_BUFFER_SIZE") {
            config.endpoint.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid NRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(timeout) = std::env::var("NRELAY_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid NRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("NRELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_endpoint_config()
            .with_context(|| "Endpoint configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_repeater_config()
            .with_context(|| "Repeater configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_endpoint_config(&self) -> Result<()> {
        self.endpoint.validate()?;

        if self.endpoint.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        // The repeater only dials the configured target for non-negotiated peers
        if self.mode == RelayMode::Proxy && self.endpoint.target_port == 0 {
            bail!("target_port must be set in proxy mode");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.event_buffer == 0 {
            bail!("event_buffer must be greater than 0");
        }

        Ok(())
    }

    fn validate_repeater_config(&self) -> Result<()> {
        self.repeater.validate()?;
        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        mode: Option<RelayMode>,
        listen: Option<&str>,
        target: Option<&str>,
        buffer_size: Option<usize>,
        connect_timeout: Option<u64>,
    ) {
        if let Some(mode) = mode {
            self.mode = mode;
            tracing::info!("CLI override: mode set to {:?}", mode);
        }

        if let Some(listen) = listen {
            if let Ok(addr) = listen.parse::<SocketAddr>() {
                self.endpoint.listen_address = addr.ip();
                self.endpoint.listen_port = addr.port();
                tracing::info!("CLI override: listen endpoint set to {}", addr);
            } else {
                tracing::warn!("Invalid listen endpoint provided: {}", listen);
            }
        }

        if let Some(target) = target {
            if let Ok(addr) = target.parse::<SocketAddr>() {
                self.endpoint.target_address = addr.ip();
                self.endpoint.target_port = addr.port();
                tracing::info!("CLI override: target endpoint set to {}", addr);
            } else {
                tracing::warn!("Invalid target endpoint provided: {}", target);
            }
        }

        if let Some(buffer_size) = buffer_size {
            self.endpoint.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.server.connect_timeout = std::time::Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.buffer_size, 4096);
        assert_eq!(config.repeater.max_attempts, 10);
        assert_eq!(config.repeater.session_lifetime, Duration::from_secs(3600));
    }

    #[test]
    fn test_load_from_file_with_partial_tables() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nrelay.toml");
        std::fs::write(
            &path,
            r#"
mode = "repeater"

[endpoint]
listen_address = "127.0.0.1"
listen_port = 5500
target_address = "10.0.0.5"
target_port = 5900

[repeater]
session_lifetime = "30m"
"#,
        )?;

        let config = ConfigManager::load_from_file(&path)?;
        assert_eq!(config.mode, RelayMode::Repeater);
        assert_eq!(config.endpoint.listen_endpoint(), "127.0.0.1:5500".parse::<SocketAddr>()?);
        assert_eq!(config.endpoint.target_endpoint(), "10.0.0.5:5900".parse::<SocketAddr>()?);
        assert_eq!(config.endpoint.buffer_size, 4096);
        assert_eq!(config.repeater.session_lifetime, Duration::from_secs(1800));
        assert_eq!(config.repeater.max_attempts, 10);
        assert_eq!(config.server.connect_timeout, Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml"))?;
        assert_eq!(config.mode, RelayMode::Proxy);
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.endpoint.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.endpoint.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.endpoint.target_port = 0;
        assert!(config.validate().is_err());
        config.mode = RelayMode::Repeater;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.repeater.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.repeater.session_lifetime = Duration::from_secs(u64::MAX / 2);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.repeater.sweep_interval = Duration::from_secs(u64::MAX / 2);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitoring.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some(RelayMode::Repeater),
            Some("127.0.0.1:6000"),
            Some("not-an-endpoint"),
            Some(8192),
            Some(3),
        );

        assert_eq!(config.mode, RelayMode::Repeater);
        assert_eq!(config.endpoint.listen_port, 6000);
        // Invalid target is ignored, default kept
        assert_eq!(config.endpoint.target_port, 4502);
        assert_eq!(config.endpoint.buffer_size, 8192);
        assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Repeater".parse::<RelayMode>(), Ok(RelayMode::Repeater));
        assert_eq!("proxy".parse::<RelayMode>(), Ok(RelayMode::Proxy));
        assert!("socks".parse::<RelayMode>().is_err());
    }
}
