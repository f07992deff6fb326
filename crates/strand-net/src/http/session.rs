//! Server-side HTTP connection
//!
//! Reads whole requests off a socket through the push parser and writes
//! encoded responses back. Bytes past a message boundary (pipelining) are
//! kept for the next `recv_request`.

use super::message::{HttpRequest, HttpResponse};
use super::parser::HttpRequestParser;
use crate::socket::Socket;
use crate::stream::SocketStream;
use std::io;
use strand_core::swarn;

const READ_CHUNK: usize = 4096;

pub struct HttpSession {
    stream: SocketStream,
    /// Unconsumed bytes from a previous read
    buffer: Vec<u8>,
}

impl HttpSession {
    pub fn new(sock: Socket) -> HttpSession {
        HttpSession {
            stream: SocketStream::new(sock),
            buffer: Vec::new(),
        }
    }

    pub fn stream(&self) -> &SocketStream {
        &self.stream
    }

    /// Read one complete request. Closes the connection and errors on a
    /// malformed message, peer close, or receive timeout.
    pub fn recv_request(&mut self) -> io::Result<HttpRequest> {
        let mut parser = HttpRequestParser::new();

        if !self.buffer.is_empty() {
            let data = std::mem::take(&mut self.buffer);
            let n = parser.execute(&data);
            if parser.has_error() {
                return self.parse_failed(&parser);
            }
            if n < data.len() {
                self.buffer.extend_from_slice(&data[n..]);
            }
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        while !parser.is_finished() {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                self.stream.close();
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before a full request",
                ));
            }
            let consumed = parser.execute(&chunk[..n]);
            if parser.has_error() {
                return self.parse_failed(&parser);
            }
            if consumed < n {
                self.buffer.extend_from_slice(&chunk[consumed..n]);
            }
        }

        Ok(parser.take_request())
    }

    fn parse_failed(&mut self, parser: &HttpRequestParser) -> io::Result<HttpRequest> {
        swarn!("http parse error: {:?}", parser.error());
        self.stream.close();
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed http request",
        ))
    }

    pub fn send_response(&self, rsp: &HttpResponse) -> io::Result<()> {
        self.stream.write_all(&rsp.encode())
    }

    pub fn close(&self) {
        self.stream.close();
    }
}
