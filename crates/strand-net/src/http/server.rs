//! HTTP server over the TCP scaffold
//!
//! Each connection runs a session loop in its own fiber: read a request,
//! let the user handler fill in the response, write it back, honor
//! keep-alive. Parse errors and timeouts end the session.

use super::message::{HttpRequest, HttpResponse};
use super::session::HttpSession;
use crate::address::Address;
use crate::socket::Socket;
use crate::tcp_server::{ClientHandler, TcpServer};
use std::sync::Arc;
use strand_core::sdebug;
use strand_runtime::IoManager;

pub type RequestHandler = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

struct HttpClientHandler {
    server_name: String,
    handler: RequestHandler,
}

impl ClientHandler for HttpClientHandler {
    fn handle_client(&self, sock: Socket) {
        let mut session = HttpSession::new(sock);
        loop {
            let req = match session.recv_request() {
                Ok(req) => req,
                Err(e) => {
                    sdebug!("http session ends: {}", e);
                    break;
                }
            };

            let mut rsp = HttpResponse::new();
            rsp.version = req.version;
            rsp.set_header("server", &self.server_name);
            (self.handler)(&req, &mut rsp);
            rsp.close = rsp.close || req.close;

            if session.send_response(&rsp).is_err() {
                break;
            }
            if rsp.close {
                break;
            }
        }
        session.close();
    }
}

pub struct HttpServer {
    tcp: Arc<TcpServer>,
}

impl HttpServer {
    /// `handler` fills the response for every request; the default reply
    /// is an empty 200 with the server header set.
    pub fn new<F>(
        io_worker: Arc<IoManager>,
        accept_worker: Arc<IoManager>,
        handler: F,
    ) -> HttpServer
    where
        F: Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    {
        let name = "strand/0.1.0".to_string();
        let tcp = TcpServer::new(
            io_worker,
            accept_worker,
            Arc::new(HttpClientHandler {
                server_name: name.clone(),
                handler: Arc::new(handler),
            }),
        );
        tcp.set_name(&name);
        HttpServer { tcp }
    }

    pub fn bind(&self, addrs: &[Address]) -> Result<(), Vec<Address>> {
        self.tcp.bind(addrs)
    }

    pub fn listen_addrs(&self) -> Vec<Address> {
        self.tcp.listen_addrs()
    }

    pub fn start(&self) {
        self.tcp.start();
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}
