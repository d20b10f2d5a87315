//! NRelay - TCP relay and RFB-style repeater
//!
//! Runs one relay engine until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nrelay::{
    config::ConfigManager,
    events::LoggingObserver,
    metrics::{Metrics, MetricsServer},
    Config, Engine, EventHub, ProxyEngine, RelayMode, RepeaterEngine, ShutdownCoordinator,
};

/// CLI arguments for NRelay
#[derive(Parser, Debug)]
#[command(name = "nrelay")]
#[command(about = "NRelay - TCP relay and RFB-style repeater")]
#[command(version)]
#[command(long_about = "
NRelay - TCP relay and RFB-style repeater

In proxy mode every connection is relayed to the configured target. In
repeater mode clients on the relay's own address negotiate their target by
answering the \"RFB 000.000\" greeting with <ip>:<port>.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  NRELAY_MODE             - proxy or repeater
  NRELAY_LISTEN_ADDRESS   - Listen IP address
  NRELAY_LISTEN_PORT      - Listen port
  NRELAY_TARGET_ADDRESS   - Target IP address
  NRELAY_TARGET_PORT      - Target port
  NRELAY_BUFFER_SIZE      - Buffer size in bytes
  NRELAY_CONNECT_TIMEOUT  - Target connect timeout (e.g., 10s)
  NRELAY_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "nrelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Relay mode (overrides config file)
    #[arg(short, long, help = "Relay mode: proxy or repeater")]
    pub mode: Option<RelayMode>,

    /// Listen endpoint (overrides config file)
    #[arg(short, long, help = "Listen endpoint (e.g., 0.0.0.0:4501)")]
    pub listen: Option<String>,

    /// Target endpoint (overrides config file)
    #[arg(short, long, help = "Target endpoint (e.g., 127.0.0.1:4502)")]
    pub target: Option<String>,

    /// Buffer size in bytes
    #[arg(long, help = "Buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Target connect timeout in seconds
    #[arg(long, help = "Target connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level (defaults to the configured level)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.mode,
        args.listen.as_deref(),
        args.target.as_deref(),
        args.buffer_size,
        args.connect_timeout,
    );

    init_tracing(&args, &config)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    info!("Starting NRelay v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let events = EventHub::new(config.server.event_buffer);
    let observer_handle = events.register(Arc::new(LoggingObserver::new(
        config.monitoring.log_payloads,
    )));

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);
    let metrics_handle = events.register(metrics.clone());

    let metrics_shutdown = CancellationToken::new();
    let metrics_server = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(metrics.clone(), addr)
                .await
                .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))?;
            Some(tokio::spawn(server.serve(metrics_shutdown.clone())))
        }
        None => {
            info!("Metrics endpoint disabled");
            None
        }
    };

    let shutdown_coordinator = ShutdownCoordinator::new(
        config.server.shutdown_timeout + std::time::Duration::from_secs(5),
    );

    let result = match config.mode {
        RelayMode::Proxy => {
            let engine = ProxyEngine::from_config(&config, events.clone())?.with_metrics(metrics);
            run_engine(&engine, &shutdown_coordinator).await
        }
        RelayMode::Repeater => {
            let engine = RepeaterEngine::from_config(&config, events.clone())?.with_metrics(metrics);
            run_engine(&engine, &shutdown_coordinator).await
        }
    };

    metrics_shutdown.cancel();
    if let Some(handle) = metrics_server {
        let _ = handle.await;
    }

    // Observer tasks drain and end once the last hub handle is gone
    drop(events);
    let drain = async {
        let _ = observer_handle.await;
        let _ = metrics_handle.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(1), drain).await.is_err() {
        info!("Sessions still closing, not waiting for observers");
    }

    info!("Relay shutdown complete");
    result
}

async fn run_engine<E: Engine>(engine: &E, shutdown_coordinator: &ShutdownCoordinator) -> Result<()> {
    let local_addr = engine.start().await.context("Failed to start relay engine")?;
    info!("NRelay listening on {}", local_addr);
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.shutdown_engine(engine).await
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Mode: {:?}", config.mode);
    info!("  Listen endpoint: {}", config.endpoint.listen_endpoint());
    info!("  Target endpoint: {}", config.endpoint.target_endpoint());
    info!("  Buffer size: {} bytes", config.endpoint.buffer_size);
    info!("  Max connections: {}", config.server.max_connections);
    info!("  Connect timeout: {:?}", config.server.connect_timeout);
    if config.mode == RelayMode::Repeater {
        info!("  Handshake attempts: {}", config.repeater.max_attempts);
        info!("  Session lifetime: {:?}", config.repeater.session_lifetime);
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(&config.monitoring.log_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
