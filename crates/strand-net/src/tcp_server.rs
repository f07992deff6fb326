//! TCP server scaffold
//!
//! One accept loop per listener runs as a fiber on the accept-worker io
//! manager; every accepted connection is handed to the handler as a fiber
//! on the io-worker manager. Both may be the same manager.
//!
//! `stop` flips the flag and then cancels/closes the listeners from
//! inside the accept worker, so parked accept fibers wake, observe the
//! flag and drain out.

use crate::address::Address;
use crate::socket::Socket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use strand_core::{serror, sinfo};
use strand_runtime::{runtime_config, FdRegistry, IoManager};

pub trait ClientHandler: Send + Sync + 'static {
    fn handle_client(&self, sock: Socket);
}

/// Closures work as handlers directly.
impl<F> ClientHandler for F
where
    F: Fn(Socket) + Send + Sync + 'static,
{
    fn handle_client(&self, sock: Socket) {
        self(sock)
    }
}

pub struct TcpServer {
    io_worker: Arc<IoManager>,
    accept_worker: Arc<IoManager>,
    handler: Arc<dyn ClientHandler>,
    socks: Mutex<Vec<Arc<Socket>>>,
    recv_timeout_ms: u64,
    name: Mutex<String>,
    stopped: AtomicBool,
}

impl TcpServer {
    pub fn new(
        io_worker: Arc<IoManager>,
        accept_worker: Arc<IoManager>,
        handler: Arc<dyn ClientHandler>,
    ) -> Arc<TcpServer> {
        Arc::new(TcpServer {
            io_worker,
            accept_worker,
            handler,
            socks: Mutex::new(Vec::new()),
            recv_timeout_ms: runtime_config().tcp_recv_timeout_ms,
            name: Mutex::new("strand/0.1.0".to_string()),
            stopped: AtomicBool::new(true),
        })
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Bind and listen on every address; all-or-nothing. On failure the
    /// addresses that failed come back and no listener stays open.
    pub fn bind(&self, addrs: &[Address]) -> Result<(), Vec<Address>> {
        let mut fails = Vec::new();
        let mut socks = self.socks.lock().unwrap();
        for addr in addrs {
            let sock = Socket::tcp(addr);
            if let Err(e) = sock.bind(addr) {
                serror!("bind failed on {}: {}", addr, e);
                fails.push(addr.clone());
                continue;
            }
            if let Err(e) = sock.listen(libc::SOMAXCONN) {
                serror!("listen failed on {}: {}", addr, e);
                fails.push(addr.clone());
                continue;
            }
            // bind() may run on a non-hooked thread; the accept loop still
            // needs the listener in the registry (and non-blocking) so its
            // fiber parks instead of pinning a worker in accept(2).
            FdRegistry::instance().get(sock.raw_fd(), true);
            socks.push(Arc::new(sock));
        }
        if !fails.is_empty() {
            socks.clear();
            return Err(fails);
        }
        for s in socks.iter() {
            sinfo!("server {} listening: {}", self.name.lock().unwrap(), s);
        }
        Ok(())
    }

    /// Bound addresses (resolves kernel-assigned ports).
    pub fn listen_addrs(&self) -> Vec<Address> {
        self.socks
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.local_addr())
            .collect()
    }

    /// Schedule one accept loop per listener.
    pub fn start(self: &Arc<Self>) {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return; // already running
        }
        let socks = self.socks.lock().unwrap().clone();
        for sock in socks {
            let me = self.clone();
            self.accept_worker.schedule(move || me.accept_loop(sock));
        }
    }

    fn accept_loop(&self, sock: Arc<Socket>) {
        while !self.stopped.load(Ordering::SeqCst) {
            match sock.accept() {
                Ok(client) => {
                    client.set_recv_timeout(self.recv_timeout_ms);
                    let handler = self.handler.clone();
                    self.io_worker
                        .schedule(move || handler.handle_client(client));
                }
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    serror!("accept failed on {}: {}", sock, e);
                    if !sock.is_valid() {
                        break;
                    }
                }
            }
        }
    }

    /// Stop accepting and close the listeners. In-flight client handlers
    /// run to completion.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.clone();
        self.accept_worker.schedule(move || {
            let socks = std::mem::take(&mut *me.socks.lock().unwrap());
            for s in socks {
                s.cancel_all();
                s.close();
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
