//! Fiber-per-connection TCP echo server.
//!
//! ```text
//! cargo run -p echo [port]        # default 8070
//! printf hi | nc 127.0.0.1 8070
//! ```

use std::sync::Arc;
use strand::{sinfo, Address, IoManager, Socket, SocketStream, TcpServer};

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8070);

    let iom = IoManager::new(4, false, "echo").expect("io manager");

    let handler = Arc::new(|sock: Socket| {
        let stream = SocketStream::new(sock);
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let server = TcpServer::new(iom.clone(), iom.clone(), handler);
    if server.bind(&[Address::any(port)]).is_err() {
        eprintln!("bind failed on port {}", port);
        std::process::exit(1);
    }
    server.start();
    sinfo!("echo server on 0.0.0.0:{}", port);

    loop {
        std::thread::park();
    }
}
