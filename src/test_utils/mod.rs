use crate::config::AppConfig;
use crate::{CertificateAuthority, Wiretap};
use rustls::pki_types::PrivateKeyDer;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Spins up a `Wiretap` bound to an OS-assigned port with a throwaway CA, so
/// integration tests don't need a real trust-store install. Returns the
/// running instance plus the temp dir backing its cert store (kept alive for
/// the duration of the test).
pub async fn spawn_proxy(intercept: bool) -> (Wiretap, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new(tmp.path().join("ca")).await.unwrap();

    let mut config = AppConfig::default();
    config.tls.intercept = intercept;
    config.tls.cert_dir = tmp.path().to_path_buf();
    config.handler.idle_timeout_secs = 5;

    let mut wiretap = Wiretap::new(ca, config);
    wiretap.start().await.unwrap();
    (wiretap, tmp)
}

/// A minimal plain-HTTP origin: accepts one connection, reads a single
/// request, answers with a fixed 200 response carrying `body`, then closes.
pub async fn spawn_echo_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

/// A TLS origin: accepts one connection, completes a server handshake with a
/// self-signed leaf, reads a single decrypted request, answers with a fixed
/// 200 response carrying `body`, then closes. Used by interception tests to
/// stand in for the real HTTPS site the proxy mints a leaf for.
pub async fn spawn_tls_echo_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut tls) = acceptor.accept(stream).await {
                let mut buf = vec![0u8; 4096];
                let _ = tls.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            }
        }
    });
    addr
}

/// A plain-HTTP origin that serves `requests` keep-alive responses off a
/// single connection, closing the connection after the last one. Used to
/// answer two or more pipelined requests sent ahead of their responses.
pub async fn spawn_keepalive_echo_server(body: &'static str, requests: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut pending = Vec::new();
            let mut buf = [0u8; 4096];
            let mut served = 0;
            while served < requests {
                if let Some(pos) = find_double_crlf(&pending) {
                    pending.drain(..pos + 4);
                    served += 1;
                    let last = served == requests;
                    let conn_header = if last { "close" } else { "keep-alive" };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
                        body.len(),
                        conn_header,
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    continue;
                }
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.shutdown().await;
        }
    });
    addr
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
