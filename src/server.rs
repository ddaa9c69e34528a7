use crate::cert::CertMint;
use crate::events::EventPublisher;
use crate::handler::ProtocolHandler;
use crate::net::{BufferedConnection, ConnTag};
use crate::plugin::{PluginBus, ProxyPlugin};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub client_recvbuf_size: usize,
    pub server_recvbuf_size: usize,
    pub disable_headers: Vec<String>,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            idle_timeout: Duration::from_secs(30),
            client_recvbuf_size: 8192,
            server_recvbuf_size: 8192,
            disable_headers: Vec::new(),
        }
    }
}

/// Accepts client connections and spawns a [`ProtocolHandler`] for each.
/// Grounded on the original accept loop's bind-then-spawn shape: `start()`
/// returns as soon as the listener is bound, with the accept loop itself
/// running in a background task until `shutdown()` is called.
#[derive(Clone)]
pub struct ProxyServer {
    config: Arc<ProxyServerConfig>,
    cert_mint: Option<Arc<CertMint>>,
    events: Arc<dyn EventPublisher>,
    listen_addr: Option<SocketAddr>,
    shutdown_notify: Arc<Notify>,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, cert_mint: Option<Arc<CertMint>>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            config: Arc::new(config),
            cert_mint,
            events,
            listen_addr: None,
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub async fn start(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.listen_addr = Some(listener.local_addr()?);

        let config = self.config.clone();
        let cert_mint = self.cert_mint.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown_notify.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted connection");
                                let config = config.clone();
                                let cert_mint = cert_mint.clone();
                                let events = events.clone();
                                tokio::spawn(async move {
                                    serve_connection(stream, peer, config, cert_mint, events).await;
                                });
                            }
                            Err(e) => error!(error = %e, "accept error"),
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn join(&self) {
        self.shutdown_notify.notified().await;
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyServerConfig>,
    cert_mint: Option<Arc<CertMint>>,
    events: Arc<dyn EventPublisher>,
) {
    let connection_id = Uuid::new_v4();
    let client = BufferedConnection::from_tcp(stream, peer, ConnTag::Client);

    let mut bus = PluginBus::new();
    bus.push(Box::new(ProxyPlugin::new(
        connection_id,
        events,
        config.disable_headers.clone(),
        config.server_recvbuf_size,
        cert_mint,
    )));

    let mut handler = ProtocolHandler::new(client, bus, config.idle_timeout, config.client_recvbuf_size);
    handler.run().await;
    debug!(%connection_id, "connection handler finished");
}
