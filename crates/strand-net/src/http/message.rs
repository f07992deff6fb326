//! HTTP message objects
//!
//! Versions are packed into one byte: 0x10 = HTTP/1.0, 0x11 = HTTP/1.1.
//! Header lookups are case-insensitive but preserve the spelling and
//! order they were set with.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Patch,
    Connect,
    Trace,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
        }
    }

    pub fn from_bytes(b: &[u8]) -> Option<HttpMethod> {
        match b {
            b"GET" => Some(HttpMethod::Get),
            b"POST" => Some(HttpMethod::Post),
            b"HEAD" => Some(HttpMethod::Head),
            b"PUT" => Some(HttpMethod::Put),
            b"DELETE" => Some(HttpMethod::Delete),
            b"OPTIONS" => Some(HttpMethod::Options),
            b"PATCH" => Some(HttpMethod::Patch),
            b"CONNECT" => Some(HttpMethod::Connect),
            b"TRACE" => Some(HttpMethod::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason phrase for a status code; "Unknown" for codes off the map.
pub fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Ordered, case-insensitive header map.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace an existing header (case-insensitive) or append.
    pub fn set(&mut self, key: &str, value: &str) {
        for (k, v) in &mut self.entries {
            if k.eq_ignore_ascii_case(key) {
                *v = value.to_string();
                return;
            }
        }
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// Append without replacing.
    pub fn add(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn version_str(version: u8) -> &'static str {
    if version == 0x10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Connection-close default for a message of `version` with an optional
/// Connection header value.
fn derive_close(version: u8, connection: Option<&str>) -> bool {
    match connection {
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        _ => version < 0x11, // 1.0 closes by default, 1.1 keeps alive
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// 0x10 or 0x11
    pub version: u8,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub close: bool,
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest {
            method: HttpMethod::Get,
            version: 0x11,
            path: "/".to_string(),
            query: String::new(),
            fragment: String::new(),
            headers: Headers::default(),
            body: Vec::new(),
            close: false,
        }
    }
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest::default()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.set(key, value);
    }

    /// Derive the close flag from the parsed headers.
    pub fn init(&mut self) {
        self.close = derive_close(self.version, self.headers.get("connection"));
    }

    /// Wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(self.method.as_str());
        out.push(' ');
        out.push_str(&self.path);
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query);
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&self.fragment);
        }
        out.push(' ');
        out.push_str(version_str(self.version));
        out.push_str("\r\n");

        for (k, v) in self.headers.iter() {
            if k.eq_ignore_ascii_case("connection") || k.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str(if self.close {
            "connection: close\r\n"
        } else {
            "connection: keep-alive\r\n"
        });
        if !self.body.is_empty() {
            out.push_str(&format!("content-length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// 0x10 or 0x11
    pub version: u8,
    pub status: u16,
    /// Empty means "use the standard reason for the code"
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub close: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            version: 0x11,
            status: 200,
            reason: String::new(),
            headers: Headers::default(),
            body: Vec::new(),
            close: false,
        }
    }
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse::default()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.set(key, value);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn init(&mut self) {
        self.close = derive_close(self.version, self.headers.get("connection"));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(version_str(self.version));
        out.push(' ');
        out.push_str(&self.status.to_string());
        out.push(' ');
        if self.reason.is_empty() {
            out.push_str(status_reason(self.status));
        } else {
            out.push_str(&self.reason);
        }
        out.push_str("\r\n");

        for (k, v) in self.headers.iter() {
            if k.eq_ignore_ascii_case("connection") || k.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str(if self.close {
            "connection: close\r\n"
        } else {
            "connection: keep-alive\r\n"
        });
        out.push_str(&format!("content-length: {}\r\n", self.body.len()));
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(HttpMethod::from_bytes(b"GET"), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::from_bytes(b"DELETE"), Some(HttpMethod::Delete));
        assert_eq!(HttpMethod::from_bytes(b"BREW"), None);
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut h = Headers::default();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        h.set("CONTENT-TYPE", "text/html");
        assert_eq!(h.len(), 1, "set replaces case-insensitively");
        assert_eq!(h.get("Content-Type"), Some("text/html"));
        h.remove("content-TYPE");
        assert!(h.is_empty());
    }

    #[test]
    fn test_close_derivation() {
        assert!(derive_close(0x10, None), "1.0 defaults to close");
        assert!(!derive_close(0x11, None), "1.1 defaults to keep-alive");
        assert!(!derive_close(0x10, Some("Keep-Alive")));
        assert!(derive_close(0x11, Some("close")));
    }

    #[test]
    fn test_request_encode() {
        let mut req = HttpRequest::new();
        req.path = "/search".to_string();
        req.query = "q=strand".to_string();
        req.set_header("host", "example.com");
        let text = req.to_string();
        assert!(text.starts_with("GET /search?q=strand HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_encode_with_body() {
        let mut rsp = HttpResponse::new();
        rsp.status = 404;
        rsp.set_body("nope");
        rsp.close = true;
        let text = rsp.to_string();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }
}
