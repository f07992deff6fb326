//! # strand-net
//!
//! Networking layer over the strand runtime. All socket I/O goes through
//! the runtime's hook module, so a blocking-looking call inside a fiber
//! suspends the fiber, never the worker thread.
//!
//! - `address` — polymorphic IPv4/IPv6/Unix socket addresses
//! - `socket` — fd wrapper with bind/listen/accept/connect-with-timeout,
//!   scatter-gather send/recv and per-direction cancellation
//! - `stream` — fixed-size read/write helpers over a socket
//! - `bytearray` — seekable chunked staging buffer with varint/zig-zag and
//!   length-prefixed codecs
//! - `tcp_server` — accept loops on one io manager, client handlers on
//!   another
//! - `http` — request/response objects, a callback-driven push parser,
//!   session and server glue

pub mod address;
pub mod bytearray;
pub mod http;
pub mod socket;
pub mod stream;
pub mod tcp_server;

pub use address::Address;
pub use bytearray::ByteArray;
pub use socket::Socket;
pub use stream::SocketStream;
pub use tcp_server::{ClientHandler, TcpServer};
