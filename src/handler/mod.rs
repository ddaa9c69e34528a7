use crate::error::HandlerError;
use crate::http::{HttpParser, ParserState, ParserType};
use crate::net::{BufferedConnection, RecvOutcome};
use crate::plugin::{AccessLogContext, PluginBus, UpstreamEvent};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-connection event loop. Owns the client socket and the main request
/// parser; everything upstream-facing (the server socket, response parsing,
/// pipelining) lives behind the plugin bus, which this loop drives one tick
/// at a time. Replaces the original's `selectors.select(timeout=1)` poll
/// with `tokio::select!` racing the client recv, the bus's own upstream
/// recv, and an idle-check tick against each other.
pub struct ProtocolHandler {
    client: BufferedConnection,
    request: HttpParser,
    bus: PluginBus,
    start: Instant,
    last_activity: Instant,
    idle_timeout: Duration,
    tick: Duration,
    client_recvbuf_size: usize,
}

impl ProtocolHandler {
    pub fn new(
        client: BufferedConnection,
        bus: PluginBus,
        idle_timeout: Duration,
        client_recvbuf_size: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            client,
            request: HttpParser::new(ParserType::Request),
            bus,
            start: now,
            last_activity: now,
            idle_timeout,
            tick: Duration::from_secs(1),
            client_recvbuf_size,
        }
    }

    fn is_inactive(&self) -> bool {
        !self.client.has_buffer() && self.last_activity.elapsed() > self.idle_timeout
    }

    /// Runs the connection to completion, always shutting it down cleanly
    /// on the way out regardless of how the loop ended.
    pub async fn run(&mut self) {
        if let Err(e) = self.run_until_done().await {
            debug!(error = %e, "connection handler stopped on error");
        }
        self.shutdown().await;
    }

    async fn run_until_done(&mut self) -> Result<(), HandlerError> {
        loop {
            if self.is_inactive() {
                debug!("closing idle connection");
                return Ok(());
            }

            if self.client.has_buffer() {
                self.client.flush().await?;
            }

            let (readable, writable) = self.bus.get_descriptors();
            if self.bus.write_to_descriptors(&writable).await {
                return Ok(());
            }

            tokio::select! {
                recv = self.client.recv(self.client_recvbuf_size) => {
                    match recv? {
                        RecvOutcome::Closed => return Ok(()),
                        RecvOutcome::Bytes(data) => {
                            self.last_activity = Instant::now();
                            if !self.on_client_data(data).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                event = self.bus.poll_upstream() => {
                    self.last_activity = Instant::now();
                    match event {
                        UpstreamEvent::Closed => {
                            self.bus.on_upstream_connection_close().await;
                        }
                        UpstreamEvent::Data(chunk) => {
                            if !self.on_upstream_chunk(chunk).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(self.tick) => {}
            }

            if self.bus.read_from_descriptors(&readable).await {
                return Ok(());
            }
        }
    }

    /// Mirrors the original's `handle_readables`: the request parser only
    /// ever sees bytes while it hasn't yet reached `Complete`. Once the
    /// first request (or CONNECT) completes, every later byte on this
    /// connection — pipelined requests, decrypted interception traffic,
    /// opaque tunnel data — is the plugin bus's problem, not this parser's.
    async fn on_client_data(&mut self, data: Bytes) -> Result<bool, HandlerError> {
        let Some(data) = self.bus.handle_client_data(data).await else {
            return Ok(!self.bus.flush_upstream().await);
        };

        if self.request.state() != ParserState::Complete {
            self.request.parse(&data)?;
            if self.request.state() == ParserState::Complete {
                if !self
                    .bus
                    .handle_client_request(&mut self.request, &mut self.client)
                    .await
                {
                    return Ok(false);
                }
                let do_connect = self
                    .bus
                    .before_upstream_connection(&mut self.request, &mut self.client)
                    .await;
                if !self
                    .bus
                    .on_request_complete(&mut self.request, &mut self.client, do_connect)
                    .await
                {
                    return Ok(false);
                }
            }
        }

        Ok(!self.bus.flush_upstream().await)
    }

    async fn on_upstream_chunk(&mut self, chunk: Bytes) -> Result<bool, HandlerError> {
        let chunk = self.bus.handle_upstream_chunk(chunk).await;
        if let Some(chunk) = self.bus.on_response_chunk(chunk).await {
            self.client.queue(&chunk);
            self.client.flush().await?;
        }
        Ok(true)
    }

    /// Flush, let plugins log and tear down their own state, then half-close
    /// and close the client socket. Errors here are swallowed the same way
    /// the original ignores `OSError` during shutdown: there is nothing left
    /// to do about a socket that is already going away.
    async fn shutdown(&mut self) {
        let _ = self.client.flush().await;
        self.log_access().await;
        self.bus.on_client_connection_close().await;
        self.bus.on_upstream_connection_close().await;
        self.client.close().await;
    }

    async fn log_access(&mut self) {
        let mut ctx = AccessLogContext {
            client_ip: self.client.addr.ip().to_string(),
            client_port: self.client.addr.port(),
            request_method: self.request.method().unwrap_or("-").to_string(),
            request_path: self.request.path().unwrap_or("-").to_string(),
            connection_time_ms: self.start.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };

        let handled = self.bus.on_access_log(&mut ctx).await;
        if handled {
            return;
        }

        if ctx.request_method == "CONNECT" {
            info!(
                client = %format!("{}:{}", ctx.client_ip, ctx.client_port),
                server = %ctx.server_host.as_deref().unwrap_or("-"),
                server_port = ctx.server_port.unwrap_or(0),
                bytes = ctx.response_bytes,
                connection_time_ms = ctx.connection_time_ms,
                "CONNECT {}", ctx.request_path,
            );
        } else {
            info!(
                client = %format!("{}:{}", ctx.client_ip, ctx.client_port),
                server = %ctx.server_host.as_deref().unwrap_or("-"),
                code = ctx.response_code.unwrap_or(0),
                reason = %ctx.response_reason.as_deref().unwrap_or("-"),
                bytes = ctx.response_bytes,
                connection_time_ms = ctx.connection_time_ms,
                "{} {}", ctx.request_method, ctx.request_path,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ConnTag;
    use crate::plugin::Plugin;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (BufferedConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let browser = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (
            BufferedConnection::from_tcp(server_side, addr, ConnTag::Client),
            browser,
        )
    }

    #[tokio::test]
    async fn idle_connection_is_closed_after_timeout() {
        let (client, _browser) = connected_pair().await;
        let mut handler =
            ProtocolHandler::new(client, PluginBus::new(), Duration::from_millis(50), 8192);

        tokio::time::timeout(Duration::from_secs(3), handler.run())
            .await
            .expect("handler should stop on its own once idle");
    }

    struct RejectingPlugin;

    #[async_trait]
    impl Plugin for RejectingPlugin {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn handle_client_request(
            &mut self,
            request: &mut HttpParser,
            client: &mut BufferedConnection,
        ) -> bool {
            if request.path() == Some("/blocked") {
                client.queue(b"HTTP/1.1 404 Blocked\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
                return false;
            }
            true
        }
    }

    #[tokio::test]
    async fn plugin_rejection_surfaces_synthesized_response() {
        let (client, mut browser) = connected_pair().await;
        let mut bus = PluginBus::new();
        bus.push(Box::new(RejectingPlugin));
        let mut handler = ProtocolHandler::new(client, bus, Duration::from_secs(5), 8192);

        let run = tokio::spawn(async move {
            handler.run().await;
        });

        browser
            .write_all(b"GET /blocked HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        browser.read_to_end(&mut response).await.unwrap();
        run.await.unwrap();

        assert!(response.starts_with(b"HTTP/1.1 404 Blocked"));
    }
}
