use bytes::{Bytes, BytesMut};

/// Which kind of HTTP message a parser instance decodes. A parser never
/// switches kind; request and response grammar differ enough (status line vs.
/// request line, close-delimited bodies only existing on responses) that a
/// single parser handling both would need to smuggle the distinction through
/// every method anyway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserType {
    Request,
    Response,
}

/// `state` only ever moves forward through this list until `reset()` is
/// called; see `HttpParser::parse` for the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserState {
    Initialized,
    LineReceived,
    ReceivingHeaders,
    HeadersComplete,
    ReceivingBody,
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyMode {
    None,
    ContentLength(usize),
    Chunked,
    UntilClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Trailer,
}

/// Incremental request/response parser. Bytes are fed in via repeated calls
/// to `parse()`; the parser carries over any unconsumed tail between calls,
/// so callers may hand it arbitrarily small slices as they arrive off the
/// wire.
pub struct HttpParser {
    kind: ParserType,
    state: ParserState,
    method: Option<String>,
    path: Option<String>,
    version: Option<String>,
    status_code: Option<u16>,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    host: Option<String>,
    port: Option<u16>,
    body: BytesMut,
    body_mode: BodyMode,
    chunk_phase: ChunkPhase,
    chunk_remaining: usize,
    total_size: usize,
    buf: BytesMut,
}

fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(line.len() - 1);
    if line.ends_with(b"\r") {
        line.truncate(line.len() - 1);
    }
    Some(line.freeze())
}

impl HttpParser {
    pub fn new(kind: ParserType) -> Self {
        Self {
            kind,
            state: ParserState::Initialized,
            method: None,
            path: None,
            version: None,
            status_code: None,
            reason: None,
            headers: Vec::new(),
            host: None,
            port: None,
            body: BytesMut::new(),
            body_mode: BodyMode::None,
            chunk_phase: ChunkPhase::Size,
            chunk_remaining: 0,
            total_size: 0,
            buf: BytesMut::new(),
        }
    }

    pub fn reset(&mut self) {
        let kind = self.kind;
        *self = HttpParser::new(kind);
    }

    pub fn kind(&self) -> ParserType {
        self.kind
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_connection_upgrade(&self) -> bool {
        let has_upgrade_token = self
            .header("connection")
            .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false);
        has_upgrade_token && self.header("upgrade").is_some()
    }

    fn parse_start_line(&mut self, line: &[u8]) -> Result<(), ParserError> {
        let line = std::str::from_utf8(line).map_err(|_| ParserError::Malformed("non-utf8 start line"))?;
        let mut parts = line.splitn(3, ' ');
        match self.kind {
            ParserType::Request => {
                let method = parts.next().ok_or(ParserError::Malformed("missing method"))?;
                let path = parts.next().ok_or(ParserError::Malformed("missing path"))?;
                let version = parts.next().unwrap_or("HTTP/1.1");
                self.method = Some(method.to_string());
                self.path = Some(path.to_string());
                self.version = Some(version.to_string());

                if method.eq_ignore_ascii_case("CONNECT") {
                    if let Some((host, port)) = path.rsplit_once(':') {
                        self.host = Some(host.to_string());
                        self.port = port.parse().ok();
                    }
                } else if let Ok(url) = url::Url::parse(path) {
                    self.host = url.host_str().map(|h| h.to_string());
                    self.port = Some(url.port_or_known_default().unwrap_or(80));
                }
            }
            ParserType::Response => {
                let version = parts.next().ok_or(ParserError::Malformed("missing version"))?;
                let status = parts.next().ok_or(ParserError::Malformed("missing status code"))?;
                let reason = parts.next().unwrap_or("");
                self.version = Some(version.to_string());
                self.status_code = Some(
                    status
                        .parse()
                        .map_err(|_| ParserError::Malformed("invalid status code"))?,
                );
                self.reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    fn add_header_line(&mut self, line: &[u8]) -> Result<(), ParserError> {
        let line = std::str::from_utf8(line).map_err(|_| ParserError::Malformed("non-utf8 header"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(ParserError::Malformed("header missing colon"))?;
        self.headers.push((name.trim().to_string(), value.trim().to_string()));
        Ok(())
    }

    fn finalize_headers(&mut self) {
        let is_chunked = self
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let content_length = self.header("content-length").and_then(|v| v.trim().parse::<usize>().ok());

        self.body_mode = if is_chunked {
            BodyMode::Chunked
        } else if let Some(len) = content_length {
            if len == 0 {
                BodyMode::None
            } else {
                BodyMode::ContentLength(len)
            }
        } else if self.kind == ParserType::Response {
            BodyMode::UntilClose
        } else {
            BodyMode::None
        };

        if self.kind == ParserType::Request && self.method.as_deref() == Some("CONNECT") {
            self.body_mode = BodyMode::None;
        }

        if self.kind == ParserType::Request && self.host.is_none() {
            if let Some(host_header) = self.header("host") {
                if let Some((host, port)) = host_header.rsplit_once(':') {
                    if port.chars().all(|c| c.is_ascii_digit()) {
                        self.host = Some(host.to_string());
                        self.port = port.parse().ok();
                    } else {
                        self.host = Some(host_header.to_string());
                    }
                } else {
                    self.host = Some(host_header.to_string());
                }
            }
        }
    }

    fn body_mode_needs_data(&self) -> bool {
        !matches!(self.body_mode, BodyMode::None)
    }

    /// Called by the handler once the underlying connection has reported
    /// EOF. The only framing mode this affects is a response with neither
    /// `Content-Length` nor `Transfer-Encoding`, whose body ends exactly
    /// when the connection does.
    pub fn notify_connection_closed(&mut self) {
        if self.body_mode == BodyMode::UntilClose && self.state == ParserState::ReceivingBody {
            self.state = ParserState::Complete;
        }
    }

    fn consume_body(&mut self) -> Result<bool, ParserError> {
        match self.body_mode {
            BodyMode::None => Ok(true),
            BodyMode::ContentLength(total) => {
                let need = total.saturating_sub(self.body.len());
                if need == 0 {
                    return Ok(true);
                }
                let take = need.min(self.buf.len());
                if take == 0 {
                    return Ok(false);
                }
                let chunk = self.buf.split_to(take);
                self.body.extend_from_slice(&chunk);
                Ok(self.body.len() >= total)
            }
            BodyMode::UntilClose => {
                if !self.buf.is_empty() {
                    let chunk = self.buf.split_to(self.buf.len());
                    self.body.extend_from_slice(&chunk);
                }
                Ok(false)
            }
            BodyMode::Chunked => self.consume_chunked(),
        }
    }

    fn consume_chunked(&mut self) -> Result<bool, ParserError> {
        loop {
            match self.chunk_phase {
                ChunkPhase::Size => match take_line(&mut self.buf) {
                    Some(line) => {
                        let text = std::str::from_utf8(&line)
                            .map_err(|_| ParserError::Malformed("invalid chunk size line"))?;
                        let size_str = text.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_str, 16)
                            .map_err(|_| ParserError::Malformed("invalid chunk size"))?;
                        if size == 0 {
                            self.chunk_phase = ChunkPhase::Trailer;
                        } else {
                            self.chunk_remaining = size;
                            self.chunk_phase = ChunkPhase::Data;
                        }
                    }
                    None => return Ok(false),
                },
                ChunkPhase::Data => {
                    if self.chunk_remaining == 0 {
                        self.chunk_phase = ChunkPhase::DataCrlf;
                        continue;
                    }
                    let take = self.chunk_remaining.min(self.buf.len());
                    if take == 0 {
                        return Ok(false);
                    }
                    let chunk = self.buf.split_to(take);
                    self.body.extend_from_slice(&chunk);
                    self.chunk_remaining -= take;
                    if self.chunk_remaining != 0 {
                        return Ok(false);
                    }
                    self.chunk_phase = ChunkPhase::DataCrlf;
                }
                ChunkPhase::DataCrlf => match take_line(&mut self.buf) {
                    Some(_) => self.chunk_phase = ChunkPhase::Size,
                    None => return Ok(false),
                },
                ChunkPhase::Trailer => match take_line(&mut self.buf) {
                    Some(line) if line.is_empty() => return Ok(true),
                    Some(_) => continue,
                    None => return Ok(false),
                },
            }
        }
    }

    /// Feed more bytes into the parser, advancing `state` as far as the
    /// buffered data permits.
    pub fn parse(&mut self, data: &[u8]) -> Result<(), ParserError> {
        self.total_size += data.len();
        self.buf.extend_from_slice(data);
        'outer: loop {
            match self.state {
                ParserState::Complete => break,
                ParserState::Initialized => match take_line(&mut self.buf) {
                    Some(line) => {
                        self.parse_start_line(&line)?;
                        self.state = ParserState::LineReceived;
                    }
                    None => break,
                },
                ParserState::LineReceived => {
                    self.state = ParserState::ReceivingHeaders;
                }
                ParserState::ReceivingHeaders => loop {
                    match take_line(&mut self.buf) {
                        Some(line) if line.is_empty() => {
                            self.finalize_headers();
                            self.state = ParserState::HeadersComplete;
                            continue 'outer;
                        }
                        Some(line) => self.add_header_line(&line)?,
                        None => break 'outer,
                    }
                },
                ParserState::HeadersComplete => {
                    self.state = if self.body_mode_needs_data() {
                        ParserState::ReceivingBody
                    } else {
                        ParserState::Complete
                    };
                }
                ParserState::ReceivingBody => {
                    if self.consume_body()? {
                        self.state = ParserState::Complete;
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize this message back to wire format, skipping any header
    /// whose name (case-insensitively) appears in `disable_headers`.
    pub fn build(&self, disable_headers: &[String]) -> Bytes {
        let mut out = BytesMut::new();
        match self.kind {
            ParserType::Request => {
                out.extend_from_slice(self.method.as_deref().unwrap_or("GET").as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.path.as_deref().unwrap_or("/").as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.version.as_deref().unwrap_or("HTTP/1.1").as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            ParserType::Response => {
                out.extend_from_slice(self.version.as_deref().unwrap_or("HTTP/1.1").as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.status_code.unwrap_or(200).to_string().as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(self.reason.as_deref().unwrap_or("OK").as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        let disabled: Vec<String> = disable_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        let mut has_content_length = false;
        let mut has_transfer_encoding = false;
        for (name, value) in &self.headers {
            let lname = name.to_ascii_lowercase();
            if disabled.contains(&lname) {
                continue;
            }
            if lname == "content-length" {
                has_content_length = true;
            }
            if lname == "transfer-encoding" {
                has_transfer_encoding = true;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.kind == ParserType::Response
            && !self.body.is_empty()
            && !has_content_length
            && !has_transfer_encoding
        {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_request_in_one_call() {
        let mut p = HttpParser::new(ParserType::Request);
        p.parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.method(), Some("GET"));
        assert_eq!(p.host(), Some("example.com"));
    }

    #[test]
    fn incremental_byte_at_a_time_reaches_same_result() {
        let raw = b"GET /a HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc";
        let mut p = HttpParser::new(ParserType::Request);
        for b in raw {
            p.parse(&[*b]).unwrap();
        }
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.body(), b"abc");
    }

    #[test]
    fn state_never_goes_backwards() {
        let mut p = HttpParser::new(ParserType::Request);
        let mut seen = vec![p.state()];
        for chunk in [b"GET / HTTP/1.1\r\n".as_slice(), b"Host: x\r\n", b"\r\n"] {
            p.parse(chunk).unwrap();
            seen.push(p.state());
        }
        for pair in seen.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut p = HttpParser::new(ParserType::Response);
        p.parse(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        p.parse(b"4\r\nWiki\r\n0\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.body(), b"Wiki");
    }

    #[test]
    fn request_without_framing_headers_completes_at_headers() {
        let mut p = HttpParser::new(ParserType::Request);
        p.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert!(p.body().is_empty());
    }

    #[test]
    fn response_without_framing_headers_waits_for_close() {
        let mut p = HttpParser::new(ParserType::Response);
        p.parse(b"HTTP/1.1 200 OK\r\n\r\nhello").unwrap();
        assert_eq!(p.state(), ParserState::ReceivingBody);
        p.notify_connection_closed();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.body(), b"hello");
    }

    #[test]
    fn connect_request_has_no_body_and_sets_host_port() {
        let mut p = HttpParser::new(ParserType::Request);
        p.parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .unwrap();
        assert_eq!(p.state(), ParserState::Complete);
        assert_eq!(p.host(), Some("example.com"));
        assert_eq!(p.port(), Some(443));
    }

    #[test]
    fn build_round_trips_request_with_disabled_header() {
        let mut p = HttpParser::new(ParserType::Request);
        p.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n")
            .unwrap();
        let built = p.build(&["proxy-connection".to_string()]);
        let built = String::from_utf8(built.to_vec()).unwrap();
        assert!(built.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!built.to_ascii_lowercase().contains("proxy-connection"));
        assert!(built.contains("Host: example.com"));
    }

    #[test]
    fn build_response_adds_content_length_when_missing() {
        let mut p = HttpParser::new(ParserType::Response);
        p.parse(b"HTTP/1.1 200 OK\r\n\r\nhi").unwrap();
        p.notify_connection_closed();
        let built = p.build(&[]);
        assert!(String::from_utf8(built.to_vec()).unwrap().contains("Content-Length: 2"));
    }

    #[test]
    fn is_connection_upgrade_requires_both_headers() {
        let mut p = HttpParser::new(ParserType::Request);
        p.parse(b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();
        assert!(p.is_connection_upgrade());
    }
}
