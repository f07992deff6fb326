//! Socket wrapper
//!
//! All I/O funnels through the runtime's hook module: inside a scheduler
//! worker these calls suspend the fiber on EAGAIN; on a plain thread they
//! behave like ordinary blocking sockets. The wrapper itself holds only
//! the fd, its family/type/protocol, the connected flag and cached
//! endpoint addresses.

use crate::address::Address;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use strand_core::SpinLock;
use strand_runtime::fd_registry::TIMEOUT_NONE;
use strand_runtime::{hook, Event, FdRegistry, IoManager, TimeoutKind};

const INVALID: RawFd = -1;

pub struct Socket {
    fd: AtomicI32,
    family: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
    connected: AtomicBool,
    local: SpinLock<Option<Address>>,
    remote: SpinLock<Option<Address>>,
}

impl Socket {
    fn with_family(family: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Socket {
        Socket {
            fd: AtomicI32::new(INVALID),
            family,
            ty,
            protocol,
            connected: AtomicBool::new(false),
            local: SpinLock::new(None),
            remote: SpinLock::new(None),
        }
    }

    /// Stream socket matching the address family.
    pub fn tcp(addr: &Address) -> Socket {
        Socket::with_family(addr.family(), libc::SOCK_STREAM, 0)
    }

    /// Datagram socket matching the address family.
    pub fn udp(addr: &Address) -> Socket {
        let s = Socket::with_family(addr.family(), libc::SOCK_DGRAM, 0);
        // No handshake on udp; send_to/recv_from work right away
        let _ = s.ensure_open();
        s
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.raw_fd() != INVALID
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let fd = hook::socket(self.family, self.ty, self.protocol);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.fd.store(fd, Ordering::Relaxed);
        self.init_options();
        Ok(())
    }

    fn init_options(&self) {
        self.set_opt_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
        if self.ty == libc::SOCK_STREAM {
            self.set_opt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        }
    }

    fn set_opt_int(&self, level: libc::c_int, opt: libc::c_int, val: libc::c_int) {
        unsafe {
            hook::setsockopt(
                self.raw_fd(),
                level,
                opt,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    // ── server side ──

    pub fn bind(&self, addr: &Address) -> io::Result<()> {
        if addr.family() != self.family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family mismatch",
            ));
        }
        self.ensure_open()?;
        let (ss, len) = addr.to_sockaddr();
        let rt = unsafe {
            libc::bind(
                self.raw_fd(),
                &ss as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        self.refresh_local();
        Ok(())
    }

    pub fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        if unsafe { libc::listen(self.raw_fd(), backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection; inside a fiber this suspends until a client
    /// arrives (or the receive timeout hits).
    pub fn accept(&self) -> io::Result<Socket> {
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            hook::accept(
                self.raw_fd(),
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Socket::with_family(self.family, self.ty, self.protocol);
        sock.fd.store(fd, Ordering::Relaxed);
        sock.connected.store(true, Ordering::Relaxed);
        sock.init_options();
        *sock.remote.lock() = Address::from_sockaddr(&ss);
        sock.refresh_local();
        Ok(sock)
    }

    // ── client side ──

    /// Connect, suspending the fiber while the handshake is in flight.
    /// `timeout_ms: None` uses the configured default.
    pub fn connect(&self, addr: &Address, timeout_ms: Option<u64>) -> io::Result<()> {
        if addr.family() != self.family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family mismatch",
            ));
        }
        self.ensure_open()?;
        let (ss, len) = addr.to_sockaddr();
        let ptr = &ss as *const _ as *const libc::sockaddr;
        let rt = unsafe {
            match timeout_ms {
                Some(ms) => hook::connect_with_timeout(self.raw_fd(), ptr, len, ms),
                None => hook::connect(self.raw_fd(), ptr, len),
            }
        };
        if rt != 0 {
            let e = io::Error::last_os_error();
            self.close();
            return Err(e);
        }
        self.connected.store(true, Ordering::Relaxed);
        self.refresh_local();
        *self.remote.lock() = Some(addr.clone());
        Ok(())
    }

    // ── data path ──

    /// Ok(0) means the peer closed.
    pub fn recv(&self, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        let n = unsafe {
            hook::recv(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn send(&self, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
        let n = unsafe {
            hook::send(
                self.raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Scatter read.
    pub fn recvv(&self, iov: &mut [libc::iovec]) -> io::Result<usize> {
        let n = unsafe { hook::readv(self.raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Gather write.
    pub fn sendv(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        let n = unsafe { hook::writev(self.raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn send_to(&self, buf: &[u8], flags: libc::c_int, addr: &Address) -> io::Result<usize> {
        let (ss, len) = addr.to_sockaddr();
        let n = unsafe {
            hook::sendto(
                self.raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                &ss as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn recv_from(
        &self,
        buf: &mut [u8],
        flags: libc::c_int,
    ) -> io::Result<(usize, Option<Address>)> {
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            hook::recvfrom(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok((n as usize, Address::from_sockaddr(&ss)))
        }
    }

    // ── timeouts ──

    pub fn set_recv_timeout(&self, ms: u64) {
        self.set_timeout_opt(libc::SO_RCVTIMEO, ms);
    }

    pub fn set_send_timeout(&self, ms: u64) {
        self.set_timeout_opt(libc::SO_SNDTIMEO, ms);
    }

    pub fn recv_timeout(&self) -> Option<u64> {
        self.lookup_timeout(TimeoutKind::Recv)
    }

    pub fn send_timeout(&self) -> Option<u64> {
        self.lookup_timeout(TimeoutKind::Send)
    }

    fn set_timeout_opt(&self, opt: libc::c_int, ms: u64) {
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        unsafe {
            hook::setsockopt(
                self.raw_fd(),
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
        }
    }

    fn lookup_timeout(&self, kind: TimeoutKind) -> Option<u64> {
        FdRegistry::instance()
            .get(self.raw_fd(), false)
            .map(|s| s.timeout(kind))
            .filter(|&t| t != TIMEOUT_NONE)
    }

    // ── cancellation ──

    /// Wake a fiber parked on readability of this socket.
    pub fn cancel_read(&self) -> bool {
        IoManager::with_current(|m| m.cancel_event(self.raw_fd(), Event::Read)).unwrap_or(false)
    }

    /// Wake a fiber parked on writability of this socket.
    pub fn cancel_write(&self) -> bool {
        IoManager::with_current(|m| m.cancel_event(self.raw_fd(), Event::Write)).unwrap_or(false)
    }

    pub fn cancel_all(&self) -> bool {
        IoManager::with_current(|m| m.cancel_all(self.raw_fd())).unwrap_or(false)
    }

    // ── misc ──

    /// Pending SO_ERROR, 0 if none.
    pub fn take_error(&self) -> io::Result<libc::c_int> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rt = unsafe {
            hook::getsockopt(
                self.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rt != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(err)
        }
    }

    pub fn local_addr(&self) -> Option<Address> {
        if let Some(a) = self.local.lock().clone() {
            return Some(a);
        }
        self.refresh_local();
        self.local.lock().clone()
    }

    pub fn remote_addr(&self) -> Option<Address> {
        self.remote.lock().clone()
    }

    fn refresh_local(&self) {
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.raw_fd(),
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt == 0 {
            *self.local.lock() = Address::from_sockaddr(&ss);
        }
    }

    pub fn close(&self) {
        let fd = self.fd.swap(INVALID, Ordering::SeqCst);
        if fd != INVALID {
            hook::close(fd);
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket(fd={} family={} type={} connected={}",
            self.raw_fd(),
            self.family,
            self.ty,
            self.is_connected()
        )?;
        if let Some(l) = self.local.lock().clone() {
            write!(f, " local={}", l)?;
        }
        if let Some(r) = self.remote.lock().clone() {
            write!(f, " remote={}", r)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hooks are off on test threads, so these exercise the plain blocking
    // path end to end.

    #[test]
    fn test_tcp_roundtrip_blocking() {
        let listener = Socket::tcp(&Address::loopback(0));
        listener.bind(&Address::loopback(0)).unwrap();
        listener.listen(16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port().unwrap() > 0);

        let client_thread = std::thread::spawn(move || {
            let client = Socket::tcp(&addr);
            client.connect(&addr, None).unwrap();
            client.send(b"ping", 0).unwrap();
            let mut buf = [0u8; 16];
            let n = client.recv(&mut buf, 0).unwrap();
            assert_eq!(&buf[..n], b"pong");
        });

        let conn = listener.accept().unwrap();
        assert!(conn.is_connected());
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"ping");
        conn.send(b"pong", 0).unwrap();
        client_thread.join().unwrap();
    }

    #[test]
    fn test_udp_roundtrip() {
        let server = Socket::udp(&Address::loopback(0));
        server.bind(&Address::loopback(0)).unwrap();
        let addr = server.local_addr().unwrap();

        let client = Socket::udp(&addr);
        client.send_to(b"dgram", 0, &addr).unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = server.recv_from(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"dgram");
        assert!(from.is_some());
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let s = Socket::tcp(&Address::loopback(0));
        let v6 = Address::ipv6("::1", 9).unwrap();
        assert!(s.bind(&v6).is_err());
    }

    #[test]
    fn test_close_invalidates() {
        let s = Socket::tcp(&Address::loopback(0));
        s.bind(&Address::loopback(0)).unwrap();
        assert!(s.is_valid());
        s.close();
        assert!(!s.is_valid());
        assert!(!s.is_connected());
    }
}
