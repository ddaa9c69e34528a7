// Library interface for wiretap: an HTTP/HTTPS forward proxy with optional
// TLS interception, exposed for both the CLI binary and integration tests.

pub mod cert;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod http;
pub mod net;
pub mod plugin;
pub mod server;

#[cfg(test)]
pub mod test_utils;
#[cfg(test)]
mod tests;

pub use cert::CertificateAuthority;
pub use config::AppConfig;
pub use error::HandlerError;
pub use events::{ChannelPublisher, EventPublisher, NullPublisher};
pub use server::{ProxyServer, ProxyServerConfig};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Top-level orchestrator: owns the certificate authority and the proxy
/// listener, and knows how to wait for a shutdown signal. Analogous to the
/// upstream `WitmProxy` struct, minus the web server and plugin registry
/// (replaced by the static `PluginBus` each connection builds for itself).
pub struct Wiretap {
    ca: CertificateAuthority,
    config: AppConfig,
    proxy_server: Option<ProxyServer>,
    shutdown_notify: Arc<Notify>,
}

impl Wiretap {
    pub fn new(ca: CertificateAuthority, config: AppConfig) -> Self {
        Self {
            ca,
            config,
            proxy_server: None,
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn proxy_listen_addr(&self) -> Option<SocketAddr> {
        self.proxy_server.as_ref().and_then(|s| s.listen_addr())
    }

    /// Initialize and start the proxy listener.
    pub async fn start(&mut self) -> Result<()> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        info!("starting wiretap");

        let bind_addr: SocketAddr = match &self.config.proxy.proxy_bind_addr {
            Some(addr) => addr.parse()?,
            None => "127.0.0.1:0".parse().unwrap(),
        };

        let cert_mint = if self.config.tls.intercept {
            Some(Arc::new(cert::CertMint::new(
                self.ca.clone(),
                self.config.tls.cert_dir.join("leaves"),
            )))
        } else {
            None
        };

        let events: Arc<dyn EventPublisher> = if self.config.events.enabled {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    info!(event_name = ?record.event_name, request_id = %record.request_id, "event");
                }
            });
            Arc::new(ChannelPublisher::new(tx))
        } else {
            Arc::new(NullPublisher)
        };

        let server_config = ProxyServerConfig {
            bind_addr,
            idle_timeout: Duration::from_secs(self.config.handler.idle_timeout_secs),
            client_recvbuf_size: self.config.handler.recvbuf_size,
            server_recvbuf_size: self.config.handler.recvbuf_size,
            disable_headers: self.config.handler.disable_headers.clone(),
        };

        let mut proxy_server = ProxyServer::new(server_config, cert_mint, events);
        proxy_server.start().await?;
        let proxy_addr = proxy_server
            .listen_addr()
            .ok_or_else(|| anyhow::anyhow!("failed to get proxy server listen address"))?;
        info!(%proxy_addr, intercept = self.config.tls.intercept, "proxy listening");

        self.proxy_server = Some(proxy_server);
        Ok(())
    }

    /// Wait for the proxy to finish running (blocks until shutdown is called).
    pub async fn join(&self) -> Result<()> {
        if let Some(proxy_server) = &self.proxy_server {
            tokio::select! {
                _ = proxy_server.join() => {},
                _ = self.listen_shutdown_signal() => {}
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!("shutting down");
        if let Some(proxy_server) = &self.proxy_server {
            proxy_server.shutdown();
        }
        self.shutdown_notify.notify_waiters();
    }

    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.join().await?;
        self.shutdown().await;
        Ok(())
    }

    async fn listen_shutdown_signal(&self) {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(_) => {
                    warn!("failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(windows)]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = terminate => {},
            _ = tokio::signal::ctrl_c() => {},
            _ = self.shutdown_notify.notified() => {},
        }
    }
}
