//! Callback-driven HTTP push parser
//!
//! Bytes go in incrementally; hooks fire as message parts are recognized:
//! message-begin, url, status, header field/value, headers-complete, body,
//! message-complete, chunk-header, chunk-complete. A span hook may fire
//! more than once for one element when it straddles buffer boundaries —
//! consumers append.
//!
//! `execute` consumes up to the end of one message and stops there, so a
//! pipelined buffer can be handed to a fresh parser for the next message.
//! Framing: Content-Length, chunked transfer-encoding (chunks surface as
//! appended body segments), or — for responses only — read-until-close.

use super::message::{HttpMethod, HttpRequest, HttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    InvalidStatus,
    InvalidHeader,
    InvalidChunkSize,
}

/// Start-line facts available at headers-complete.
pub struct Head {
    pub version: u8,
    pub method: Option<HttpMethod>,
    pub status: u16,
}

pub trait ParserHooks {
    fn on_message_begin(&mut self) {}
    fn on_url(&mut self, _data: &[u8]) {}
    fn on_status(&mut self, _data: &[u8]) {}
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_headers_complete(&mut self, _head: &Head) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self) {}
    fn on_chunk_header(&mut self, _size: u64) {}
    fn on_chunk_complete(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Method,
    BeforeUrl,
    Url,
    ReqVersion,
    ResVersion,
    StatusCode,
    StatusReason,
    LineAlmostDone,
    HeaderStart,
    HeaderField,
    HeaderValueStart,
    HeaderValue,
    HeaderAlmostDone,
    HeadersAlmostDone,
    BodyIdentity,
    BodyUntilEof,
    ChunkSize,
    ChunkExt,
    ChunkSizeAlmostDone,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    ChunkTrailer,
    ChunkTrailerLine,
    ChunkEndLf,
}

#[inline]
fn is_token(b: u8) -> bool {
    (33..=126).contains(&b) && b != b':'
}

#[inline]
fn hex_val(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'f' => Some((b - b'a' + 10) as u64),
        b'A'..=b'F' => Some((b - b'A' + 10) as u64),
        _ => None,
    }
}

pub struct HttpParser {
    kind: ParserKind,
    state: State,
    error: Option<ParseError>,
    // start-line facts
    version: u8,
    method: Option<HttpMethod>,
    status: u16,
    // framing
    content_length: Option<u64>,
    chunked: bool,
    body_remaining: u64,
    chunk_size: u64,
    chunk_seen: bool,
    // scratch
    token: Vec<u8>,
    field_buf: String,
    value_buf: String,
}

impl HttpParser {
    pub fn request() -> HttpParser {
        Self::with_kind(ParserKind::Request)
    }

    pub fn response() -> HttpParser {
        Self::with_kind(ParserKind::Response)
    }

    fn with_kind(kind: ParserKind) -> HttpParser {
        HttpParser {
            kind,
            state: State::Start,
            error: None,
            version: 0x11,
            method: None,
            status: 0,
            content_length: None,
            chunked: false,
            body_remaining: 0,
            chunk_size: 0,
            chunk_seen: false,
            token: Vec::new(),
            field_buf: String::new(),
            value_buf: String::new(),
        }
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn begin_message(&mut self) {
        self.version = 0x11;
        self.method = None;
        self.status = 0;
        self.content_length = None;
        self.chunked = false;
        self.body_remaining = 0;
        self.chunk_size = 0;
        self.chunk_seen = false;
        self.token.clear();
        self.field_buf.clear();
        self.value_buf.clear();
    }

    fn parse_version(&mut self) -> Result<(), ParseError> {
        let t = &self.token;
        if t.len() != 8
            || &t[..5] != b"HTTP/"
            || !t[5].is_ascii_digit()
            || t[6] != b'.'
            || !t[7].is_ascii_digit()
        {
            return Err(ParseError::InvalidVersion);
        }
        self.version = ((t[5] - b'0') << 4) | (t[7] - b'0');
        Ok(())
    }

    /// One committed header line; framing headers are interpreted here.
    fn process_header(&mut self) -> Result<(), ParseError> {
        match self.field_buf.as_str() {
            "content-length" => {
                let v: u64 = self
                    .value_buf
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidHeader)?;
                self.content_length = Some(v);
            }
            "transfer-encoding" => {
                if self.value_buf.to_ascii_lowercase().contains("chunked") {
                    self.chunked = true;
                }
            }
            _ => {}
        }
        self.field_buf.clear();
        self.value_buf.clear();
        Ok(())
    }

    fn chunk_header(&mut self, hooks: &mut dyn ParserHooks) {
        hooks.on_chunk_header(self.chunk_size);
        self.state = if self.chunk_size == 0 {
            State::ChunkTrailer
        } else {
            State::ChunkData
        };
    }

    /// Feed bytes. Returns how many were consumed; consumption stops at a
    /// parse error or right after a complete message.
    pub fn execute(&mut self, hooks: &mut dyn ParserHooks, data: &[u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }
        let len = data.len();
        let mut i = 0;

        // Span continuations from the previous buffer start at 0
        let mut url_mark = (self.state == State::Url).then_some(0usize);
        let mut field_mark = (self.state == State::HeaderField).then_some(0usize);
        let mut value_mark = (self.state == State::HeaderValue).then_some(0usize);
        let mut status_mark = (self.state == State::StatusReason).then_some(0usize);

        macro_rules! fail {
            ($e:expr) => {{
                self.error = Some($e);
                return i;
            }};
        }

        while i < len {
            let b = data[i];
            match self.state {
                State::Start => {
                    // Tolerate stray CRLF between pipelined messages
                    if b != b'\r' && b != b'\n' {
                        self.begin_message();
                        hooks.on_message_begin();
                        match self.kind {
                            ParserKind::Request => {
                                if !is_token(b) {
                                    fail!(ParseError::InvalidMethod);
                                }
                                self.token.push(b);
                                self.state = State::Method;
                            }
                            ParserKind::Response => {
                                if b != b'H' {
                                    fail!(ParseError::InvalidVersion);
                                }
                                self.token.push(b);
                                self.state = State::ResVersion;
                            }
                        }
                    }
                }

                State::Method => {
                    if b == b' ' {
                        self.method = match HttpMethod::from_bytes(&self.token) {
                            Some(m) => Some(m),
                            None => fail!(ParseError::InvalidMethod),
                        };
                        self.state = State::BeforeUrl;
                    } else if is_token(b) && self.token.len() < 16 {
                        self.token.push(b);
                    } else {
                        fail!(ParseError::InvalidMethod);
                    }
                }

                State::BeforeUrl => {
                    if b == b'\r' || b == b'\n' {
                        fail!(ParseError::InvalidUrl);
                    } else if b != b' ' {
                        url_mark = Some(i);
                        self.state = State::Url;
                    }
                }

                State::Url => {
                    if b == b' ' {
                        if let Some(m) = url_mark.take() {
                            hooks.on_url(&data[m..i]);
                        }
                        self.token.clear();
                        self.state = State::ReqVersion;
                    } else if b == b'\r' || b == b'\n' {
                        // HTTP/0.9 style lines are not served
                        fail!(ParseError::InvalidVersion);
                    }
                }

                State::ReqVersion => {
                    if b == b'\r' || b == b'\n' {
                        if let Err(e) = self.parse_version() {
                            fail!(e);
                        }
                        self.state = if b == b'\r' {
                            State::LineAlmostDone
                        } else {
                            State::HeaderStart
                        };
                    } else if self.token.len() < 10 {
                        self.token.push(b);
                    } else {
                        fail!(ParseError::InvalidVersion);
                    }
                }

                State::ResVersion => {
                    if b == b' ' {
                        if let Err(e) = self.parse_version() {
                            fail!(e);
                        }
                        self.state = State::StatusCode;
                    } else if self.token.len() < 10 {
                        self.token.push(b);
                    } else {
                        fail!(ParseError::InvalidVersion);
                    }
                }

                State::StatusCode => {
                    if b.is_ascii_digit() {
                        self.status = self.status * 10 + (b - b'0') as u16;
                        if self.status > 999 {
                            fail!(ParseError::InvalidStatus);
                        }
                    } else if b == b' ' {
                        self.state = State::StatusReason;
                    } else if b == b'\r' {
                        self.state = State::LineAlmostDone;
                    } else if b == b'\n' {
                        self.state = State::HeaderStart;
                    } else {
                        fail!(ParseError::InvalidStatus);
                    }
                }

                State::StatusReason => {
                    if b == b'\r' || b == b'\n' {
                        if let Some(m) = status_mark.take() {
                            hooks.on_status(&data[m..i]);
                        }
                        self.state = if b == b'\r' {
                            State::LineAlmostDone
                        } else {
                            State::HeaderStart
                        };
                    } else if status_mark.is_none() {
                        status_mark = Some(i);
                    }
                }

                State::LineAlmostDone => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidHeader);
                    }
                    self.state = State::HeaderStart;
                }

                State::HeaderStart => {
                    if b == b'\r' {
                        self.state = State::HeadersAlmostDone;
                    } else if b == b'\n' {
                        if let Some(consumed) = self.headers_complete(hooks, i) {
                            return consumed;
                        }
                    } else if is_token(b) {
                        field_mark = Some(i);
                        self.field_buf.push(b.to_ascii_lowercase() as char);
                        self.state = State::HeaderField;
                    } else {
                        fail!(ParseError::InvalidHeader);
                    }
                }

                State::HeaderField => {
                    if b == b':' {
                        if let Some(m) = field_mark.take() {
                            hooks.on_header_field(&data[m..i]);
                        }
                        self.state = State::HeaderValueStart;
                    } else if is_token(b) {
                        self.field_buf.push(b.to_ascii_lowercase() as char);
                    } else {
                        fail!(ParseError::InvalidHeader);
                    }
                }

                State::HeaderValueStart => {
                    if b == b' ' || b == b'\t' {
                        // skip leading whitespace
                    } else if b == b'\r' || b == b'\n' {
                        hooks.on_header_value(&[]);
                        if let Err(e) = self.process_header() {
                            fail!(e);
                        }
                        self.state = if b == b'\r' {
                            State::HeaderAlmostDone
                        } else {
                            State::HeaderStart
                        };
                    } else {
                        value_mark = Some(i);
                        self.value_buf.push(b as char);
                        self.state = State::HeaderValue;
                    }
                }

                State::HeaderValue => {
                    if b == b'\r' || b == b'\n' {
                        if let Some(m) = value_mark.take() {
                            hooks.on_header_value(&data[m..i]);
                        }
                        if let Err(e) = self.process_header() {
                            fail!(e);
                        }
                        self.state = if b == b'\r' {
                            State::HeaderAlmostDone
                        } else {
                            State::HeaderStart
                        };
                    } else {
                        self.value_buf.push(b as char);
                    }
                }

                State::HeaderAlmostDone => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidHeader);
                    }
                    self.state = State::HeaderStart;
                }

                State::HeadersAlmostDone => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidHeader);
                    }
                    if let Some(consumed) = self.headers_complete(hooks, i) {
                        return consumed;
                    }
                }

                State::BodyIdentity => {
                    let take = self.body_remaining.min((len - i) as u64) as usize;
                    hooks.on_body(&data[i..i + take]);
                    self.body_remaining -= take as u64;
                    i += take - 1;
                    if self.body_remaining == 0 {
                        hooks.on_message_complete();
                        self.state = State::Start;
                        return i + 1;
                    }
                }

                State::BodyUntilEof => {
                    hooks.on_body(&data[i..]);
                    i = len - 1;
                }

                State::ChunkSize => {
                    if let Some(d) = hex_val(b) {
                        self.chunk_size = match self
                            .chunk_size
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(d))
                        {
                            Some(v) => v,
                            None => fail!(ParseError::InvalidChunkSize),
                        };
                        self.chunk_seen = true;
                    } else if b == b';' && self.chunk_seen {
                        self.state = State::ChunkExt;
                    } else if b == b'\r' && self.chunk_seen {
                        self.state = State::ChunkSizeAlmostDone;
                    } else if b == b'\n' && self.chunk_seen {
                        self.chunk_header(hooks);
                    } else {
                        fail!(ParseError::InvalidChunkSize);
                    }
                }

                State::ChunkExt => {
                    if b == b'\r' {
                        self.state = State::ChunkSizeAlmostDone;
                    } else if b == b'\n' {
                        self.chunk_header(hooks);
                    }
                }

                State::ChunkSizeAlmostDone => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidChunkSize);
                    }
                    self.chunk_header(hooks);
                }

                State::ChunkData => {
                    let take = self.chunk_size.min((len - i) as u64) as usize;
                    hooks.on_body(&data[i..i + take]);
                    self.chunk_size -= take as u64;
                    i += take - 1;
                    if self.chunk_size == 0 {
                        self.state = State::ChunkDataCr;
                    }
                }

                State::ChunkDataCr => {
                    if b == b'\r' {
                        self.state = State::ChunkDataLf;
                    } else if b == b'\n' {
                        hooks.on_chunk_complete();
                        self.chunk_seen = false;
                        self.state = State::ChunkSize;
                    } else {
                        fail!(ParseError::InvalidChunkSize);
                    }
                }

                State::ChunkDataLf => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidChunkSize);
                    }
                    hooks.on_chunk_complete();
                    self.chunk_seen = false;
                    self.state = State::ChunkSize;
                }

                State::ChunkTrailer => {
                    if b == b'\r' {
                        self.state = State::ChunkEndLf;
                    } else if b == b'\n' {
                        hooks.on_chunk_complete();
                        hooks.on_message_complete();
                        self.state = State::Start;
                        return i + 1;
                    } else {
                        // Trailer headers are consumed and dropped
                        self.state = State::ChunkTrailerLine;
                    }
                }

                State::ChunkTrailerLine => {
                    if b == b'\n' {
                        self.state = State::ChunkTrailer;
                    }
                }

                State::ChunkEndLf => {
                    if b != b'\n' {
                        fail!(ParseError::InvalidChunkSize);
                    }
                    hooks.on_chunk_complete();
                    hooks.on_message_complete();
                    self.state = State::Start;
                    return i + 1;
                }
            }
            i += 1;
        }

        // Buffer ended mid-span: flush partial pieces
        match self.state {
            State::Url => {
                if let Some(m) = url_mark {
                    hooks.on_url(&data[m..]);
                }
            }
            State::HeaderField => {
                if let Some(m) = field_mark {
                    hooks.on_header_field(&data[m..]);
                }
            }
            State::HeaderValue => {
                if let Some(m) = value_mark {
                    hooks.on_header_value(&data[m..]);
                }
            }
            State::StatusReason => {
                if let Some(m) = status_mark {
                    hooks.on_status(&data[m..]);
                }
            }
            _ => {}
        }
        len
    }

    /// End of headers: decide the body framing. Returns Some(consumed)
    /// when the message is already complete at this byte.
    fn headers_complete(&mut self, hooks: &mut dyn ParserHooks, i: usize) -> Option<usize> {
        let head = Head {
            version: self.version,
            method: self.method,
            status: self.status,
        };
        hooks.on_headers_complete(&head);

        if self.chunked {
            self.chunk_size = 0;
            self.chunk_seen = false;
            self.state = State::ChunkSize;
            return None;
        }
        if let Some(cl) = self.content_length {
            if cl == 0 {
                hooks.on_message_complete();
                self.state = State::Start;
                return Some(i + 1);
            }
            self.body_remaining = cl;
            self.state = State::BodyIdentity;
            return None;
        }
        match self.kind {
            ParserKind::Request => {
                hooks.on_message_complete();
                self.state = State::Start;
                Some(i + 1)
            }
            ParserKind::Response => {
                self.state = State::BodyUntilEof;
                None
            }
        }
    }

    /// Signal end of input, completing a read-until-close response body.
    pub fn finish(&mut self, hooks: &mut dyn ParserHooks) {
        if self.state == State::BodyUntilEof {
            hooks.on_message_complete();
            self.state = State::Start;
        }
    }
}

// ── request/response assemblers ──

#[derive(PartialEq, Eq, Clone, Copy)]
enum LastCb {
    Neither,
    Field,
    Value,
}

struct RequestBuilder {
    req: HttpRequest,
    url: String,
    field: String,
    value: String,
    last: LastCb,
    finished: bool,
}

impl RequestBuilder {
    fn new() -> RequestBuilder {
        RequestBuilder {
            req: HttpRequest::default(),
            url: String::new(),
            field: String::new(),
            value: String::new(),
            last: LastCb::Neither,
            finished: false,
        }
    }

    fn commit_header(&mut self) {
        if !self.field.is_empty() {
            self.req.headers.add(&self.field, self.value.trim());
        }
        self.field.clear();
        self.value.clear();
        self.last = LastCb::Neither;
    }

    fn split_url(&mut self) {
        let url = std::mem::take(&mut self.url);
        let (rest, fragment) = match url.split_once('#') {
            Some((r, f)) => (r.to_string(), f.to_string()),
            None => (url, String::new()),
        };
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (rest, String::new()),
        };
        self.req.path = if path.is_empty() { "/".to_string() } else { path };
        self.req.query = query;
        self.req.fragment = fragment;
    }
}

impl ParserHooks for RequestBuilder {
    fn on_url(&mut self, data: &[u8]) {
        self.url.push_str(&String::from_utf8_lossy(data));
    }

    fn on_header_field(&mut self, data: &[u8]) {
        if self.last == LastCb::Value {
            self.commit_header();
        }
        self.field.push_str(&String::from_utf8_lossy(data));
        self.last = LastCb::Field;
    }

    fn on_header_value(&mut self, data: &[u8]) {
        self.value.push_str(&String::from_utf8_lossy(data));
        self.last = LastCb::Value;
    }

    fn on_headers_complete(&mut self, head: &Head) {
        if self.last == LastCb::Value {
            self.commit_header();
        }
        self.req.version = head.version;
        if let Some(m) = head.method {
            self.req.method = m;
        }
        self.split_url();
    }

    fn on_body(&mut self, data: &[u8]) {
        self.req.body.extend_from_slice(data);
    }

    fn on_message_complete(&mut self) {
        self.finished = true;
    }
}

/// Assembles an `HttpRequest` from a byte stream.
pub struct HttpRequestParser {
    parser: HttpParser,
    builder: RequestBuilder,
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestParser {
    pub fn new() -> HttpRequestParser {
        HttpRequestParser {
            parser: HttpParser::request(),
            builder: RequestBuilder::new(),
        }
    }

    pub fn execute(&mut self, data: &[u8]) -> usize {
        self.parser.execute(&mut self.builder, data)
    }

    pub fn has_error(&self) -> bool {
        self.parser.error().is_some()
    }

    pub fn error(&self) -> Option<ParseError> {
        self.parser.error()
    }

    pub fn is_finished(&self) -> bool {
        self.builder.finished
    }

    pub fn content_length(&self) -> Option<u64> {
        self.parser.content_length()
    }

    /// The assembled request, with its close flag derived.
    pub fn take_request(&mut self) -> HttpRequest {
        let mut req = std::mem::take(&mut self.builder.req);
        req.init();
        req
    }
}

struct ResponseBuilder {
    rsp: HttpResponse,
    field: String,
    value: String,
    last: LastCb,
    finished: bool,
}

impl ResponseBuilder {
    fn new() -> ResponseBuilder {
        ResponseBuilder {
            rsp: HttpResponse::default(),
            field: String::new(),
            value: String::new(),
            last: LastCb::Neither,
            finished: false,
        }
    }

    fn commit_header(&mut self) {
        if !self.field.is_empty() {
            self.rsp.headers.add(&self.field, self.value.trim());
        }
        self.field.clear();
        self.value.clear();
        self.last = LastCb::Neither;
    }
}

impl ParserHooks for ResponseBuilder {
    fn on_status(&mut self, data: &[u8]) {
        self.rsp.reason.push_str(&String::from_utf8_lossy(data));
    }

    fn on_header_field(&mut self, data: &[u8]) {
        if self.last == LastCb::Value {
            self.commit_header();
        }
        self.field.push_str(&String::from_utf8_lossy(data));
        self.last = LastCb::Field;
    }

    fn on_header_value(&mut self, data: &[u8]) {
        self.value.push_str(&String::from_utf8_lossy(data));
        self.last = LastCb::Value;
    }

    fn on_headers_complete(&mut self, head: &Head) {
        if self.last == LastCb::Value {
            self.commit_header();
        }
        self.rsp.version = head.version;
        self.rsp.status = head.status;
    }

    fn on_body(&mut self, data: &[u8]) {
        self.rsp.body.extend_from_slice(data);
    }

    fn on_message_complete(&mut self) {
        self.finished = true;
    }
}

/// Assembles an `HttpResponse` from a byte stream.
pub struct HttpResponseParser {
    parser: HttpParser,
    builder: ResponseBuilder,
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponseParser {
    pub fn new() -> HttpResponseParser {
        HttpResponseParser {
            parser: HttpParser::response(),
            builder: ResponseBuilder::new(),
        }
    }

    pub fn execute(&mut self, data: &[u8]) -> usize {
        self.parser.execute(&mut self.builder, data)
    }

    /// End of input for read-until-close responses.
    pub fn finish(&mut self) {
        self.parser.finish(&mut self.builder);
    }

    pub fn has_error(&self) -> bool {
        self.parser.error().is_some()
    }

    pub fn error(&self) -> Option<ParseError> {
        self.parser.error()
    }

    pub fn is_finished(&self) -> bool {
        self.builder.finished
    }

    pub fn take_response(&mut self) -> HttpResponse {
        let mut rsp = std::mem::take(&mut self.builder.rsp);
        rsp.init();
        rsp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_get() {
        let mut p = HttpRequestParser::new();
        let data = b"GET /index.html?x=1#top HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let n = p.execute(data);
        assert_eq!(n, data.len());
        assert!(!p.has_error());
        assert!(p.is_finished());

        let req = p.take_request();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.version, 0x11);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.fragment, "top");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.header("ACCEPT"), Some("*/*"));
        assert!(!req.close, "1.1 without connection header keeps alive");
    }

    #[test]
    fn test_post_with_body() {
        let mut p = HttpRequestParser::new();
        let data = b"POST /submit HTTP/1.0\r\nContent-Length: 11\r\n\r\nhello world";
        let n = p.execute(data);
        assert_eq!(n, data.len());
        assert!(p.is_finished());

        let req = p.take_request();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.version, 0x10);
        assert_eq!(req.body, b"hello world");
        assert!(req.close, "1.0 without keep-alive closes");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut p = HttpRequestParser::new();
        let data = b"PUT /a/b HTTP/1.1\r\nX-Long-Header-Name: some long value here\r\nContent-Length: 3\r\n\r\nxyz";
        for &b in data.iter() {
            assert_eq!(p.execute(&[b]), 1);
            assert!(!p.has_error());
        }
        assert!(p.is_finished());
        let req = p.take_request();
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.header("x-long-header-name"), Some("some long value here"));
        assert_eq!(req.body, b"xyz");
    }

    #[test]
    fn test_pipelined_requests_stop_at_boundary() {
        let mut p = HttpRequestParser::new();
        let data = b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n";
        let n = p.execute(data);
        assert!(p.is_finished());
        assert_eq!(&data[n..], b"GET /two HTTP/1.1\r\n\r\n");

        let mut p2 = HttpRequestParser::new();
        let n2 = p2.execute(&data[n..]);
        assert_eq!(n + n2, data.len());
        assert!(p2.is_finished());
        assert_eq!(p2.take_request().path, "/two");
    }

    #[test]
    fn test_invalid_method() {
        let mut p = HttpRequestParser::new();
        p.execute(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(p.error(), Some(ParseError::InvalidMethod));
    }

    #[test]
    fn test_invalid_version() {
        let mut p = HttpRequestParser::new();
        p.execute(b"GET / HTTQ/1.1\r\n\r\n");
        assert_eq!(p.error(), Some(ParseError::InvalidVersion));
    }

    #[test]
    fn test_bad_content_length() {
        let mut p = HttpRequestParser::new();
        p.execute(b"GET / HTTP/1.1\r\nContent-Length: banana\r\n\r\n");
        assert_eq!(p.error(), Some(ParseError::InvalidHeader));
    }

    #[test]
    fn test_response_with_content_length() {
        let mut p = HttpResponseParser::new();
        let data =
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\noops!";
        let n = p.execute(data);
        assert_eq!(n, data.len());
        assert!(p.is_finished());

        let rsp = p.take_response();
        assert_eq!(rsp.status, 404);
        assert_eq!(rsp.reason, "Not Found");
        assert_eq!(rsp.version, 0x11);
        assert_eq!(rsp.header("content-type"), Some("text/plain"));
        assert_eq!(rsp.body, b"oops!");
    }

    #[test]
    fn test_response_until_eof() {
        let mut p = HttpResponseParser::new();
        p.execute(b"HTTP/1.0 200 OK\r\n\r\npart one, ");
        assert!(!p.is_finished());
        p.execute(b"part two");
        p.finish();
        assert!(p.is_finished());
        let rsp = p.take_response();
        assert_eq!(rsp.body, b"part one, part two");
    }

    #[test]
    fn test_chunked_body() {
        struct Chunks {
            inner: RequestBuilder,
            headers: Vec<u64>,
            completes: usize,
        }
        impl ParserHooks for Chunks {
            fn on_url(&mut self, d: &[u8]) {
                self.inner.on_url(d)
            }
            fn on_header_field(&mut self, d: &[u8]) {
                self.inner.on_header_field(d)
            }
            fn on_header_value(&mut self, d: &[u8]) {
                self.inner.on_header_value(d)
            }
            fn on_headers_complete(&mut self, h: &Head) {
                self.inner.on_headers_complete(h)
            }
            fn on_body(&mut self, d: &[u8]) {
                self.inner.on_body(d)
            }
            fn on_message_complete(&mut self) {
                self.inner.on_message_complete()
            }
            fn on_chunk_header(&mut self, size: u64) {
                self.headers.push(size);
            }
            fn on_chunk_complete(&mut self) {
                self.completes += 1;
            }
        }

        let mut parser = HttpParser::request();
        let mut hooks = Chunks {
            inner: RequestBuilder::new(),
            headers: Vec::new(),
            completes: 0,
        };
        let data = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                     4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let n = parser.execute(&mut hooks, data);
        assert_eq!(n, data.len());
        assert!(parser.error().is_none());
        assert!(hooks.inner.finished);
        assert_eq!(hooks.inner.req.body, b"Wikipedia");
        assert_eq!(hooks.headers, vec![4, 5, 0]);
        assert_eq!(hooks.completes, 3, "two data chunks plus the final chunk");
    }

    #[test]
    fn test_chunked_with_trailers() {
        let mut p = HttpRequestParser::new();
        let data = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                     3\r\nabc\r\n0\r\nX-Trailer: ignored\r\n\r\n";
        let n = p.execute(data);
        assert_eq!(n, data.len());
        assert!(p.is_finished());
        assert_eq!(p.take_request().body, b"abc");
    }

    #[test]
    fn test_header_folding_of_spans() {
        // Split inside a header name and inside its value
        let mut p = HttpRequestParser::new();
        p.execute(b"GET / HTTP/1.1\r\nX-Cus");
        p.execute(b"tom: par");
        p.execute(b"tial\r\n\r\n");
        assert!(p.is_finished());
        assert_eq!(p.take_request().header("x-custom"), Some("partial"));
    }

    #[test]
    fn test_empty_header_value() {
        let mut p = HttpRequestParser::new();
        p.execute(b"GET / HTTP/1.1\r\nX-Empty:\r\n\r\n");
        assert!(p.is_finished());
        assert_eq!(p.take_request().header("x-empty"), Some(""));
    }

    #[test]
    fn test_leading_crlf_tolerated() {
        let mut p = HttpRequestParser::new();
        p.execute(b"\r\nGET / HTTP/1.1\r\n\r\n");
        assert!(p.is_finished());
    }
}
