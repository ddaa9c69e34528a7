use super::{AccessLogContext, Plugin, UpstreamEvent};
use crate::cert::CertMint;
use crate::error::HandlerError;
use crate::events::{next_thread_id, timestamp_secs, EventName, EventPublisher, EventRecord};
use crate::http::{HttpParser, ParserType};
use crate::net::tls;
use crate::net::{BufferedConnection, ConnTag, RecvOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Headers stripped before forwarding a request upstream, and before
/// re-serializing it for `build()`. `proxy-connection` is a legacy
/// Netscape-ism some clients still send; `proxy-authorization` must never
/// reach the origin server.
fn hop_by_hop_headers() -> Vec<String> {
    vec!["proxy-authorization".to_string(), "proxy-connection".to_string()]
}

/// Built-in plugin that does the actual forwarding: opens the upstream
/// connection, tunnels or intercepts CONNECT requests, strips hop-by-hop
/// headers on plain HTTP requests, and threads pipelined requests/responses
/// through their own parsers once the first exchange on a connection is
/// done. Every proxy built on this crate registers exactly one of these,
/// first in the bus, so it is the plugin `PluginBus::poll_upstream` drives.
pub struct ProxyPlugin {
    connection_id: Uuid,
    start: Instant,
    events: Arc<dyn EventPublisher>,
    disable_headers: Vec<String>,
    server_recvbuf_size: usize,
    interception: Option<Arc<CertMint>>,

    server: Option<BufferedConnection>,
    response: HttpParser,
    pipeline_request: Option<HttpParser>,
    pipeline_response: Option<HttpParser>,

    /// Plain CONNECT without interception: bytes in both directions are
    /// opaque and must never touch a parser.
    tunneling: bool,
    tunnel_bytes: u64,
}

impl ProxyPlugin {
    pub fn new(
        connection_id: Uuid,
        events: Arc<dyn EventPublisher>,
        disable_headers: Vec<String>,
        server_recvbuf_size: usize,
        interception: Option<Arc<CertMint>>,
    ) -> Self {
        Self {
            connection_id,
            start: Instant::now(),
            events,
            disable_headers,
            server_recvbuf_size,
            interception,
            server: None,
            response: HttpParser::new(ParserType::Response),
            pipeline_request: None,
            pipeline_response: None,
            tunneling: false,
            tunnel_bytes: 0,
        }
    }

    fn emit_request_complete(&self, request: &HttpParser) {
        let url = if request.method() == Some("CONNECT") {
            request.path().unwrap_or_default().to_string()
        } else {
            format!(
                "http://{}:{}{}",
                request.host().unwrap_or_default(),
                request.port().unwrap_or(80),
                request.path().unwrap_or_default()
            )
        };
        let headers: serde_json::Map<String, serde_json::Value> = request
            .headers()
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let body = if request.method() == Some("POST") {
            Some(String::from_utf8_lossy(request.body()).to_string())
        } else {
            None
        };
        self.events.publish(EventRecord {
            request_id: self.connection_id,
            process_id: std::process::id(),
            thread_id: next_thread_id(),
            event_timestamp: timestamp_secs(std::time::SystemTime::now()),
            event_name: EventName::RequestComplete,
            event_payload: serde_json::json!({
                "url": url,
                "method": request.method(),
                "headers": headers,
                "body": body,
            }),
            publisher_id: Some("proxy-plugin".to_string()),
        });
    }

    async fn connect_upstream(&mut self, host: &str, port: u16) -> std::io::Result<()> {
        let stream = TcpStream::connect((host, port)).await?;
        let addr: SocketAddr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
        self.server = Some(BufferedConnection::from_tcp(stream, addr, ConnTag::Server));
        Ok(())
    }

    /// Upgrade both legs of an already-connected CONNECT tunnel to TLS: the
    /// client leg presents a freshly minted leaf, the server leg connects
    /// with certificate verification disabled so the real upstream
    /// certificate can be inspected and impersonated.
    async fn intercept(&mut self, host: &str, client: &mut BufferedConnection) -> Result<(), HandlerError> {
        let mint = self.interception.clone().expect("intercept called without a cert mint");
        let server = self.server.as_mut().expect("intercept called before upstream connect");

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| HandlerError::Rejected(format!("invalid server name: {host}")))?;
        server.wrap_client(server_name, tls::insecure_client_config()).await?;
        let peer_cert = server.peer_certificate();

        let minted = mint.mint(host, peer_cert.as_ref(), self.connection_id).await?;
        let server_config = tls::server_config_for(&minted).map_err(crate::cert::CertError::from)?;
        client.wrap_server(Arc::new(server_config)).await?;

        Ok(())
    }
}

#[async_trait]
impl Plugin for ProxyPlugin {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn on_request_complete(
        &mut self,
        request: &mut HttpParser,
        client: &mut BufferedConnection,
        do_connect: bool,
    ) -> bool {
        if !request.has_host() {
            debug!("rejecting request with no resolvable host");
            return false;
        }
        self.emit_request_complete(request);

        let host = request.host().unwrap_or_default().to_string();
        let port = request.port().unwrap_or(80);

        if do_connect {
            if let Err(e) = self.connect_upstream(&host, port).await {
                warn!(host, port, error = %e, "upstream connect failed");
                client.queue(BAD_GATEWAY);
                return false;
            }
        }

        let is_connect = request.method() == Some("CONNECT");

        if is_connect {
            if self.server.is_none() {
                return true;
            }
            client.queue(TUNNEL_ESTABLISHED);
            if self.interception.is_some() {
                if let Err(e) = self.intercept(&host, client).await {
                    warn!(host, error = %e, "TLS interception failed");
                    return false;
                }
            } else {
                self.tunneling = true;
            }
        } else if let Some(server) = self.server.as_mut() {
            for name in hop_by_hop_headers() {
                request.remove_header(&name);
            }
            request.add_header("Via", "1.1 wiretap");
            let built = request.build(&self.disable_headers);
            server.queue(&built);
        }

        true
    }

    async fn handle_client_data(&mut self, data: Bytes) -> Option<Bytes> {
        // No upstream connected yet (still receiving the first request, or
        // `before_upstream_connection` vetoed the connect): pass the bytes
        // through untouched so the handler's own request parser sees them.
        let Some(server) = self.server.as_mut() else {
            return Some(data);
        };

        if self.tunneling {
            server.queue(&data);
            self.tunnel_bytes += data.len() as u64;
            return None;
        }

        if let Some(pending) = &self.pipeline_request {
            if pending.is_connection_upgrade() {
                server.queue(&data);
                return None;
            }
        }

        let pipeline_request = self
            .pipeline_request
            .get_or_insert_with(|| HttpParser::new(ParserType::Request));
        if let Err(e) = pipeline_request.parse(&data) {
            warn!(error = %e, "dropping malformed pipelined request");
            return None;
        }

        if pipeline_request.is_complete() {
            for name in hop_by_hop_headers() {
                pipeline_request.remove_header(&name);
            }
            pipeline_request.add_header("Via", "1.1 wiretap");
            let upgrade = pipeline_request.is_connection_upgrade();
            let built = pipeline_request.build(&self.disable_headers);
            server.queue(&built);
            if !upgrade {
                self.pipeline_request = None;
            }
        }

        None
    }

    async fn poll_upstream(&mut self) -> UpstreamEvent {
        let Some(server) = self.server.as_mut() else {
            std::future::pending::<()>().await;
            unreachable!()
        };

        let raw = match server.recv(self.server_recvbuf_size).await {
            Ok(RecvOutcome::Bytes(b)) => b,
            Ok(RecvOutcome::Closed) => return UpstreamEvent::Closed,
            Err(e) => {
                debug!(error = %e, "upstream recv failed");
                return UpstreamEvent::Closed;
            }
        };

        if self.tunneling {
            self.tunnel_bytes += raw.len() as u64;
            return UpstreamEvent::Data(raw);
        }

        if self.response.is_complete() {
            let pipeline_response = self
                .pipeline_response
                .get_or_insert_with(|| HttpParser::new(ParserType::Response));
            if pipeline_response.parse(&raw).is_ok() && pipeline_response.is_complete() {
                self.pipeline_response = None;
            }
        } else {
            let _ = self.response.parse(&raw);
        }

        UpstreamEvent::Data(raw)
    }

    async fn on_access_log(&mut self, ctx: &mut AccessLogContext) -> bool {
        if let Some(server) = &self.server {
            ctx.server_host = Some(server.addr.ip().to_string());
            ctx.server_port = Some(server.addr.port());
        }
        if self.tunneling {
            ctx.response_bytes = self.tunnel_bytes as usize;
        } else {
            ctx.response_bytes = self.response.total_size();
            ctx.response_code = self.response.status_code();
            ctx.response_reason = self.response.reason().map(|r| r.to_string());
        }
        true
    }

    async fn flush_upstream(&mut self) -> bool {
        if let Some(server) = self.server.as_mut() {
            if let Err(e) = server.flush().await {
                warn!(error = %e, "upstream flush failed");
                return true;
            }
        }
        false
    }

    async fn on_client_connection_close(&mut self) {
        debug!(elapsed_ms = self.start.elapsed().as_millis() as u64, "client connection closed");
    }

    async fn on_upstream_connection_close(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullPublisher;

    fn new_plugin() -> ProxyPlugin {
        ProxyPlugin::new(
            Uuid::new_v4(),
            Arc::new(NullPublisher),
            hop_by_hop_headers(),
            8192,
            None,
        )
    }

    #[tokio::test]
    async fn request_missing_host_is_rejected() {
        let mut plugin = new_plugin();
        let mut request = HttpParser::new(ParserType::Request);
        request.parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = BufferedConnection::from_tcp(stream, addr, ConnTag::Client);

        let ok = plugin.on_request_complete(&mut request, &mut client, true).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn handle_client_data_without_server_passes_through() {
        let mut plugin = new_plugin();
        let data = Bytes::from_static(b"irrelevant");
        let out = plugin.handle_client_data(data.clone()).await;
        assert_eq!(out, Some(data));
    }
}
