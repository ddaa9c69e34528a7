//! End-to-end tests driving the proxy over real sockets, grounded in the
//! same shape as the original's full-stack test: start the proxy, start a
//! plain origin server, issue a request *through* the proxy, and check the
//! response that comes back out the other side.

#[cfg(test)]
mod tests {
    use crate::test_utils::{
        spawn_echo_server, spawn_keepalive_echo_server, spawn_proxy, spawn_tls_echo_server,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn request_through_proxy(proxy_addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn plain_get_is_forwarded_to_origin() {
        let (proxy, _tmp) = spawn_proxy(false).await;
        let origin_addr = spawn_echo_server("hello from origin").await;
        let proxy_addr = proxy.proxy_listen_addr().unwrap();

        let request = format!(
            "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
        );
        let response = request_through_proxy(proxy_addr, &request).await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello from origin"));
    }

    #[tokio::test]
    async fn connect_without_interception_tunnels_opaque_bytes() {
        let (proxy, _tmp) = spawn_proxy(false).await;
        let origin_addr = spawn_echo_server("tunneled").await;
        let proxy_addr = proxy.proxy_listen_addr().unwrap();

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        let connect_req = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        stream.write_all(connect_req.as_bytes()).await.unwrap();

        let mut established = [0u8; 1024];
        let n = stream.read(&mut established).await.unwrap();
        let established = String::from_utf8_lossy(&established[..n]);
        assert!(established.starts_with("HTTP/1.1 200"));

        let plain_req = format!("GET / HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(plain_req.as_bytes()).await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        let rest = String::from_utf8_lossy(&rest);
        assert!(rest.ends_with("tunneled"));
    }

    #[tokio::test]
    async fn connect_with_interception_decrypts_and_forwards() {
        let (proxy, _tmp) = spawn_proxy(true).await;
        let origin_addr = spawn_tls_echo_server("decrypted by the proxy").await;
        let proxy_addr = proxy.proxy_listen_addr().unwrap();

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
        let connect_req = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        stream.write_all(connect_req.as_bytes()).await.unwrap();

        let mut established = [0u8; 1024];
        let n = stream.read(&mut established).await.unwrap();
        let established = String::from_utf8_lossy(&established[..n]);
        assert!(established.starts_with("HTTP/1.1 200"));

        let server_name =
            rustls::pki_types::ServerName::try_from(origin_addr.ip().to_string()).unwrap();
        let connector = tokio_rustls::TlsConnector::from(crate::net::tls::insecure_client_config());
        let mut tls_stream = connector.connect(server_name, stream).await.unwrap();

        let plain_req = format!("GET / HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n");
        tls_stream.write_all(plain_req.as_bytes()).await.unwrap();

        let mut rest = Vec::new();
        tls_stream.read_to_end(&mut rest).await.unwrap();
        let rest = String::from_utf8_lossy(&rest);
        assert!(rest.starts_with("HTTP/1.1 200"));
        assert!(rest.ends_with("decrypted by the proxy"));
    }

    #[tokio::test]
    async fn upstream_connect_failure_returns_bad_gateway() {
        let (proxy, _tmp) = spawn_proxy(false).await;
        let proxy_addr = proxy.proxy_listen_addr().unwrap();

        // Bind to grab a free port, then drop the listener so nothing answers there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let request = format!(
            "GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\nConnection: close\r\n\r\n"
        );
        let response = request_through_proxy(proxy_addr, &request).await;

        assert!(response.starts_with("HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_each_forwarded_and_answered() {
        let (proxy, _tmp) = spawn_proxy(false).await;
        let origin_addr = spawn_keepalive_echo_server("pipelined", 2).await;
        let proxy_addr = proxy.proxy_listen_addr().unwrap();

        let mut stream = TcpStream::connect(proxy_addr).await.unwrap();

        let first = format!("GET http://{origin_addr}/a HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        stream.write_all(first.as_bytes()).await.unwrap();

        // Give the handler time to complete the first request and connect
        // upstream before the second request lands, so the two requests
        // exercise the pipeline-request path rather than racing the initial
        // connection setup in a single chunk.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let second = format!(
            "GET http://{origin_addr}/b HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(second.as_bytes()).await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        let rest = String::from_utf8_lossy(&rest);

        assert_eq!(rest.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(rest.matches("pipelined").count(), 2);
    }
}
