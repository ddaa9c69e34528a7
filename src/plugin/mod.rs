pub mod bus;
pub mod proxy_plugin;

pub use bus::PluginBus;
pub use proxy_plugin::ProxyPlugin;

use crate::http::HttpParser;
use crate::net::BufferedConnection;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Opaque handle a plugin can register through `get_descriptors` to be woken
/// up on its own I/O, distinct from the client/server sockets the handler
/// already multiplexes. None of the built-in plugins register any, since
/// their I/O rides on connections the handler or the proxy plugin already
/// own, but the hook exists for a plugin that talks to a cache or an
/// out-of-band service.
pub type DescriptorId = u64;

/// Context built by the handler for `on_access_log`: client identity and
/// request line are filled in before dispatch, server-side fields are left
/// for the proxy plugin (or another plugin that owns the upstream leg) to
/// complete.
#[derive(Clone, Debug, Default)]
pub struct AccessLogContext {
    pub client_ip: String,
    pub client_port: u16,
    pub request_method: String,
    pub request_path: String,
    pub connection_time_ms: f64,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub response_bytes: usize,
    pub response_code: Option<u16>,
    pub response_reason: Option<String>,
    pub extra: HashMap<String, String>,
}

/// Per-connection hook set a `ProtocolHandler` dispatches to in insertion
/// order. Every hook that can short-circuit the connection returns `bool`
/// (`false` tears the connection down, or for the request-mutating hooks,
/// aborts that operation) or `Option<Bytes>` (`None` means the plugin
/// consumed the data and nothing further should be forwarded); the handler
/// stops calling later plugins as soon as one short-circuits.
#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Dispatched once the client's request completes, before
    /// `on_request_complete`. Returning `false` asks the eventual connector
    /// (ordinarily the proxy plugin) to skip opening an upstream connection.
    /// The client connection is passed through so a plugin that vetoes the
    /// connect can still queue a synthesized response before teardown.
    async fn before_upstream_connection(
        &mut self,
        _request: &mut HttpParser,
        _client: &mut BufferedConnection,
    ) -> bool {
        true
    }

    /// Called for the completed client request, and again for every
    /// pipelined request completed mid-connection. Returning `false` aborts
    /// the request (and, for the first request, tears the connection down).
    /// A rejecting plugin can queue a response (e.g. a 404) on `client`
    /// before returning `false`, so the client sees it before the socket
    /// closes.
    async fn handle_client_request(
        &mut self,
        _request: &mut HttpParser,
        _client: &mut BufferedConnection,
    ) -> bool {
        true
    }

    /// Called once the main request parser reaches `Complete`, with the
    /// aggregate `do_connect` decision from `before_upstream_connection` and
    /// the client connection the plugin may upgrade in place (e.g. to
    /// terminate TLS for interception). Returning `false` tears the
    /// connection down.
    async fn on_request_complete(
        &mut self,
        _request: &mut HttpParser,
        _client: &mut BufferedConnection,
        _do_connect: bool,
    ) -> bool {
        true
    }

    /// Called with every raw chunk read from the client before it is parsed
    /// or forwarded. Returning `None` means the plugin has fully handled
    /// this chunk itself (e.g. queued it directly upstream) and the handler
    /// should not parse or forward it further this tick.
    async fn handle_client_data(&mut self, data: Bytes) -> Option<Bytes> {
        Some(data)
    }

    /// Called with every raw chunk read from the upstream server before it
    /// is queued to the client.
    async fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Bytes {
        chunk
    }

    /// Called with every chunk about to be flushed to the client.
    async fn on_response_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
        Some(chunk)
    }

    /// Called once per connection teardown with the access-log context the
    /// handler has already filled in with client/request fields. Returning
    /// `false` means the plugin has logged the context itself and the
    /// handler's own access-log line should be suppressed.
    async fn on_access_log(&mut self, _ctx: &mut AccessLogContext) -> bool {
        true
    }

    async fn on_client_connection_close(&mut self) {}

    async fn on_upstream_connection_close(&mut self) {}

    fn get_descriptors(&self) -> (Vec<DescriptorId>, Vec<DescriptorId>) {
        (Vec::new(), Vec::new())
    }

    /// Returning `true` tears the connection down.
    async fn write_to_descriptors(&mut self, _writable: &[DescriptorId]) -> bool {
        false
    }

    async fn read_from_descriptors(&mut self, _readable: &[DescriptorId]) -> bool {
        false
    }

    /// Await this plugin's own upstream connection for the next chunk ready
    /// to forward to the client, the tokio-idiomatic stand-in for
    /// `get_descriptors`/`read_from_descriptors` when that "other descriptor"
    /// is itself a socket the handler can select against directly. A plugin
    /// with no upstream of its own never resolves, so the handler's
    /// `tokio::select!` simply never picks this branch for it.
    ///
    /// Only one plugin in the bus is polled this way per tick (see
    /// `PluginBus::poll_upstream`); the built-in proxy plugin is always
    /// registered first so it is the one driven.
    async fn poll_upstream(&mut self) -> UpstreamEvent {
        std::future::pending::<()>().await;
        unreachable!()
    }

    /// Flush whatever this plugin has queued on its own upstream connection.
    /// Returning `true` tears the client connection down, matching the other
    /// descriptor hooks above.
    async fn flush_upstream(&mut self) -> bool {
        false
    }
}

/// Outcome of [`Plugin::poll_upstream`].
pub enum UpstreamEvent {
    /// A chunk the proxy plugin has already folded into its response /
    /// pipeline-response parsing, ready to pass through `on_response_chunk`
    /// and on to the client.
    Data(Bytes),
    Closed,
}
