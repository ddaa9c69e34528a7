use super::{AccessLogContext, DescriptorId, Plugin, UpstreamEvent};
use crate::http::HttpParser;
use crate::net::BufferedConnection;
use bytes::Bytes;

/// Ordered collection of plugins, dispatched in insertion order exactly as
/// the upstream handler iterates its `Dict[str, Plugin]` (Python dicts
/// preserve insertion order since 3.7, which the original relies on).
#[derive(Default)]
pub struct PluginBus {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginBus {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn push(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn before_upstream_connection(
        &mut self,
        request: &mut HttpParser,
        client: &mut BufferedConnection,
    ) -> bool {
        for plugin in &mut self.plugins {
            if !plugin.before_upstream_connection(request, client).await {
                return false;
            }
        }
        true
    }

    pub async fn handle_client_request(
        &mut self,
        request: &mut HttpParser,
        client: &mut BufferedConnection,
    ) -> bool {
        for plugin in &mut self.plugins {
            if !plugin.handle_client_request(request, client).await {
                return false;
            }
        }
        true
    }

    pub async fn on_request_complete(
        &mut self,
        request: &mut HttpParser,
        client: &mut BufferedConnection,
        do_connect: bool,
    ) -> bool {
        for plugin in &mut self.plugins {
            if !plugin.on_request_complete(request, client, do_connect).await {
                return false;
            }
        }
        true
    }

    /// Returns `None` as soon as any plugin consumes the data, short-circuiting
    /// the rest of the chain exactly as the original's `if o is None: return None`.
    pub async fn handle_client_data(&mut self, mut data: Bytes) -> Option<Bytes> {
        for plugin in &mut self.plugins {
            data = plugin.handle_client_data(data).await?;
        }
        Some(data)
    }

    pub async fn handle_upstream_chunk(&mut self, mut chunk: Bytes) -> Bytes {
        for plugin in &mut self.plugins {
            chunk = plugin.handle_upstream_chunk(chunk).await;
        }
        chunk
    }

    pub async fn on_response_chunk(&mut self, mut chunk: Bytes) -> Option<Bytes> {
        for plugin in &mut self.plugins {
            chunk = plugin.on_response_chunk(chunk).await?;
        }
        Some(chunk)
    }

    /// Returns `true` once a plugin reports it has logged the context
    /// itself, matching the original's `log_handled` flag.
    pub async fn on_access_log(&mut self, ctx: &mut AccessLogContext) -> bool {
        for plugin in &mut self.plugins {
            if !plugin.on_access_log(ctx).await {
                return true;
            }
        }
        false
    }

    pub async fn on_client_connection_close(&mut self) {
        for plugin in &mut self.plugins {
            plugin.on_client_connection_close().await;
        }
    }

    pub async fn on_upstream_connection_close(&mut self) {
        for plugin in &mut self.plugins {
            plugin.on_upstream_connection_close().await;
        }
    }

    pub fn get_descriptors(&self) -> (Vec<DescriptorId>, Vec<DescriptorId>) {
        let mut r = Vec::new();
        let mut w = Vec::new();
        for plugin in &self.plugins {
            let (pr, pw) = plugin.get_descriptors();
            r.extend(pr);
            w.extend(pw);
        }
        (r, w)
    }

    pub async fn write_to_descriptors(&mut self, writable: &[DescriptorId]) -> bool {
        for plugin in &mut self.plugins {
            if plugin.write_to_descriptors(writable).await {
                return true;
            }
        }
        false
    }

    pub async fn read_from_descriptors(&mut self, readable: &[DescriptorId]) -> bool {
        for plugin in &mut self.plugins {
            if plugin.read_from_descriptors(readable).await {
                return true;
            }
        }
        false
    }

    /// Polls only the first registered plugin's upstream connection. This
    /// bus only ever holds the built-in proxy plugin plus optional
    /// observers that do not own a socket of their own, so there is never
    /// more than one real upstream leg to race the client recv against; a
    /// second socket-owning plugin would need a genuine multi-way select,
    /// which this single-slot shortcut does not attempt.
    pub async fn poll_upstream(&mut self) -> UpstreamEvent {
        match self.plugins.first_mut() {
            Some(plugin) => plugin.poll_upstream().await,
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    pub async fn flush_upstream(&mut self) -> bool {
        for plugin in &mut self.plugins {
            if plugin.flush_upstream().await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RejectAll;

    #[async_trait]
    impl Plugin for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }

        async fn handle_client_request(
            &mut self,
            _request: &mut HttpParser,
            _client: &mut BufferedConnection,
        ) -> bool {
            false
        }
    }

    struct CountingPlugin {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle_client_request(
            &mut self,
            _request: &mut HttpParser,
            _client: &mut BufferedConnection,
        ) -> bool {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }
    }

    async fn test_client() -> BufferedConnection {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        BufferedConnection::from_tcp(stream, addr, crate::net::ConnTag::Client)
    }

    #[tokio::test]
    async fn short_circuits_on_first_rejection() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut bus = PluginBus::new();
        bus.push(Box::new(RejectAll));
        bus.push(Box::new(CountingPlugin { calls: calls.clone() }));

        let mut request = HttpParser::new(crate::http::ParserType::Request);
        let mut client = test_client().await;
        let ok = bus.handle_client_request(&mut request, &mut client).await;
        assert!(!ok);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatches_in_insertion_order_when_all_pass() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut bus = PluginBus::new();
        bus.push(Box::new(CountingPlugin { calls: calls.clone() }));
        bus.push(Box::new(CountingPlugin { calls: calls.clone() }));

        let mut request = HttpParser::new(crate::http::ParserType::Request);
        let mut client = test_client().await;
        let ok = bus.handle_client_request(&mut request, &mut client).await;
        assert!(ok);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
