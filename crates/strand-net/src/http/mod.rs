//! HTTP/1.0 and HTTP/1.1 codec
//!
//! - `message` — method/status/header types, `HttpRequest`/`HttpResponse`
//! - `parser` — callback-driven push parser plus request/response
//!   assemblers
//! - `session` — server-side connection: read requests, write responses
//! - `server` — a `TcpServer` handler speaking HTTP with keep-alive

pub mod message;
pub mod parser;
pub mod server;
pub mod session;

pub use message::{Headers, HttpMethod, HttpRequest, HttpResponse};
pub use parser::{HttpRequestParser, HttpResponseParser, ParseError};
pub use server::HttpServer;
pub use session::HttpSession;
