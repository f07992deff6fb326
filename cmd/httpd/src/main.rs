//! Minimal HTTP server on the fiber runtime.
//!
//! ```text
//! cargo run -p httpd [port]       # default 8080
//! curl http://127.0.0.1:8080/hello
//! ```
//!
//! Separate accept and io managers, the way a larger deployment would
//! split them.

use strand::http::HttpServer;
use strand::{sinfo, Address, IoManager};

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let io_worker = IoManager::new(4, false, "io").expect("io manager");
    let accept_worker = IoManager::new(1, false, "accept").expect("accept manager");

    let server = HttpServer::new(io_worker.clone(), accept_worker.clone(), |req, rsp| {
        rsp.set_header("content-type", "text/plain");
        rsp.set_body(format!("fiber {} served {}\n", strand::Fiber::current_id(), req.path));
    });

    if server.bind(&[Address::any(port)]).is_err() {
        eprintln!("bind failed on port {}", port);
        std::process::exit(1);
    }
    server.start();
    sinfo!("httpd on 0.0.0.0:{}", port);

    loop {
        std::thread::park();
    }
}
