//! Metrics HTTP Server
//!
//! Minimal HTTP endpoint for Prometheus scraping and liveness checks.

use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics endpoint
    pub async fn bind(metrics: Arc<Metrics>, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %bind_addr, "Metrics server bound");
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Metrics server stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(client_addr = %addr, "Metrics request received");

                        let metrics = self.metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut stream, metrics).await {
                                error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept metrics connection");
                    }
                }
            }
        }
    }
}

/// Handle a single HTTP request for metrics
async fn handle_request(stream: &mut TcpStream, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);

    let (status, content_type, body) = if request.starts_with("GET /metrics") {
        (
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.export_prometheus(),
        )
    } else if request.starts_with("GET /health") {
        ("200 OK", "text/plain", "OK".to_string())
    } else {
        ("404 Not Found", "text/plain", "Not Found".to_string())
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    debug!(status, "Sent metrics response");

    Ok(())
}
