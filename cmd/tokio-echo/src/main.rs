//! Tokio echo server, kept as a like-for-like benchmark peer for the
//! fiber-based `echo` binary.
//!
//! ```text
//! cargo run -p tokio-echo --release [port]    # default 8071
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8071);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    eprintln!("tokio echo on 0.0.0.0:{}", port);

    loop {
        let (mut sock, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
