use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream as ClientTlsStream, server::TlsStream as ServerTlsStream};

/// Which side of a connection a `BufferedConnection` represents, matching the
/// `tag` attribute carried by `TcpClientConnection`/`TcpServerConnection` upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnTag {
    Client,
    Server,
}

impl std::fmt::Display for ConnTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnTag::Client => write!(f, "client"),
            ConnTag::Server => write!(f, "server"),
        }
    }
}

/// Outcome of a single `recv()` call. `Closed` is distinct from an empty read:
/// a closed peer returns `Closed`, a would-block read simply never resolves
/// (tokio's readiness model means there is no "empty, not closed" outcome).
pub enum RecvOutcome {
    Closed,
    Bytes(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("operation would block")]
    Retryable,
    #[error("connection reset by peer")]
    Reset,
    #[error("operation timed out")]
    Timeout,
    #[error("fatal connection error: {0}")]
    Fatal(#[from] io::Error),
}

fn classify_io_error(err: io::Error) -> ConnError {
    match err.kind() {
        io::ErrorKind::WouldBlock => ConnError::Retryable,
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted => {
            ConnError::Reset
        }
        io::ErrorKind::TimedOut => ConnError::Timeout,
        _ => ConnError::Fatal(err),
    }
}

enum Transport {
    Plain(TcpStream),
    TlsClient(Box<ClientTlsStream<TcpStream>>),
    TlsServer(Box<ServerTlsStream<TcpStream>>),
}

/// A socket plus an outbound byte queue. Writes are queued with `queue()` and
/// only actually sent on `flush()`, mirroring the client/server connection
/// wrappers the handler drives one select tick at a time.
pub struct BufferedConnection {
    // `None` only ever appears transiently inside `wrap_client`/`wrap_server`
    // while the underlying socket is being handed to the TLS handshake.
    transport: Option<Transport>,
    pub tag: ConnTag,
    pub addr: SocketAddr,
    outbound: BytesMut,
    closed: bool,
    total_sent: u64,
    total_received: u64,
}

impl BufferedConnection {
    pub fn from_tcp(stream: TcpStream, addr: SocketAddr, tag: ConnTag) -> Self {
        Self {
            transport: Some(Transport::Plain(stream)),
            tag,
            addr,
            outbound: BytesMut::new(),
            closed: false,
            total_sent: 0,
            total_received: 0,
        }
    }

    fn transport_mut(&mut self) -> &mut Transport {
        self.transport.as_mut().expect("connection transport missing mid-wrap")
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_buffer(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self.transport, Some(Transport::Plain(_)))
    }

    /// Append bytes to the outbound queue. Does not perform I/O.
    pub fn queue(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    pub async fn recv(&mut self, max: usize) -> Result<RecvOutcome, ConnError> {
        let mut buf = vec![0u8; max];
        let n = match self.transport_mut() {
            Transport::Plain(s) => s.read(&mut buf).await,
            Transport::TlsClient(s) => s.read(&mut buf).await,
            Transport::TlsServer(s) => s.read(&mut buf).await,
        }
        .map_err(classify_io_error)?;
        if n == 0 {
            self.closed = true;
            return Ok(RecvOutcome::Closed);
        }
        self.total_received += n as u64;
        buf.truncate(n);
        Ok(RecvOutcome::Bytes(Bytes::from(buf)))
    }

    /// Drain the outbound queue. Returns the number of bytes written.
    pub async fn flush(&mut self) -> Result<usize, ConnError> {
        if self.outbound.is_empty() {
            return Ok(0);
        }
        let chunk = self.outbound.split().freeze();
        let res = match self.transport_mut() {
            Transport::Plain(s) => s.write_all(&chunk).await,
            Transport::TlsClient(s) => s.write_all(&chunk).await,
            Transport::TlsServer(s) => s.write_all(&chunk).await,
        };
        match res {
            Ok(()) => {
                self.total_sent += chunk.len() as u64;
                Ok(chunk.len())
            }
            Err(e) => {
                // Once a write has failed there's no reliable way to know how much of
                // `chunk` made it to the peer, so it is not requeued.
                Err(classify_io_error(e))
            }
        }
    }

    /// Upgrade this connection in place to act as the TLS client, e.g. when
    /// connecting to an upstream server that is about to be intercepted.
    /// Takes `&mut self` rather than consuming, so a plugin that only
    /// borrows the connection through a hook argument can still perform the
    /// upgrade.
    pub async fn wrap_client(
        &mut self,
        server_name: ServerName<'static>,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<(), ConnError> {
        let tcp = match self.transport.take() {
            Some(Transport::Plain(tcp)) => tcp,
            other => {
                self.transport = other;
                return Err(ConnError::Fatal(io::Error::other("connection is already TLS-wrapped")));
            }
        };
        let connector = TlsConnector::from(config);
        match connector.connect(server_name, tcp).await {
            Ok(tls) => {
                self.transport = Some(Transport::TlsClient(Box::new(tls)));
                Ok(())
            }
            Err(e) => Err(classify_io_error(e)),
        }
    }

    /// Upgrade this connection in place to act as the TLS server, e.g. when
    /// intercepting a client's CONNECT tunnel with a minted leaf certificate.
    pub async fn wrap_server(&mut self, config: Arc<rustls::ServerConfig>) -> Result<(), ConnError> {
        let tcp = match self.transport.take() {
            Some(Transport::Plain(tcp)) => tcp,
            other => {
                self.transport = other;
                return Err(ConnError::Fatal(io::Error::other("connection is already TLS-wrapped")));
            }
        };
        let acceptor = TlsAcceptor::from(config);
        match acceptor.accept(tcp).await {
            Ok(tls) => {
                self.transport = Some(Transport::TlsServer(Box::new(tls)));
                Ok(())
            }
            Err(e) => Err(classify_io_error(e)),
        }
    }

    /// The leaf certificate the remote peer presented during the TLS
    /// handshake, when this connection acted as the TLS client (i.e. when
    /// connecting to an upstream server about to be intercepted).
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match self.transport.as_ref()? {
            Transport::TlsClient(s) => {
                let (_, conn) = s.get_ref();
                conn.peer_certificates()?.first().cloned()
            }
            _ => None,
        }
    }

    /// Best-effort clean shutdown: `close_notify` for TLS, then a half-close
    /// of the underlying socket. Errors are not surfaced, matching the
    /// upstream handler which swallows `OSError` on shutdown.
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            let _ = match transport {
                Transport::Plain(s) => s.shutdown().await,
                Transport::TlsClient(s) => s.shutdown().await,
                Transport::TlsServer(s) => s.shutdown().await,
            };
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn queue_then_flush_sends_bytes() {
        let (client, server) = pair().await;
        let addr = client.local_addr().unwrap();
        let mut conn = BufferedConnection::from_tcp(client, addr, ConnTag::Client);
        conn.queue(b"hello");
        assert!(conn.has_buffer());
        let sent = conn.flush().await.unwrap();
        assert_eq!(sent, 5);
        assert!(!conn.has_buffer());

        let mut server_conn = BufferedConnection::from_tcp(server, addr, ConnTag::Server);
        match server_conn.recv(1024).await.unwrap() {
            RecvOutcome::Bytes(b) => assert_eq!(&b[..], b"hello"),
            RecvOutcome::Closed => panic!("expected bytes"),
        }
    }

    #[tokio::test]
    async fn recv_reports_closed_on_eof() {
        let (client, server) = pair().await;
        let addr = server.local_addr().unwrap();
        drop(client);
        let mut conn = BufferedConnection::from_tcp(server, addr, ConnTag::Server);
        match conn.recv(1024).await.unwrap() {
            RecvOutcome::Closed => assert!(conn.is_closed()),
            RecvOutcome::Bytes(_) => panic!("expected closed"),
        }
    }
}
