//! Process-wide fd bookkeeping for the hook layer
//!
//! Every fd the hooks have seen gets a record: is it a socket, did the
//! runtime force O_NONBLOCK on it, has the *user* asked for non-blocking,
//! and what send/recv timeouts apply. The invariant the hook fast path
//! leans on: any socket known to the registry is non-blocking at the
//! kernel level, whether or not the user knows.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// No timeout configured.
pub const TIMEOUT_NONE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// Map SO_RCVTIMEO / SO_SNDTIMEO.
    pub fn from_sockopt(optname: libc::c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

pub struct FdState {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdState {
    fn new(fd: RawFd) -> FdState {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let state = FdState {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        };

        if is_socket {
            // Force non-blocking under the covers; the user-visible flags
            // are reconstructed by the hooked fcntl.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            state.sys_nonblock.store(true, Ordering::Relaxed);
        }

        state
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdState>>>>,
}

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            slots: RwLock::new(Vec::from_iter((0..64).map(|_| None))),
        }
    }

    /// The process-wide registry.
    pub fn instance() -> &'static FdRegistry {
        static INSTANCE: OnceLock<FdRegistry> = OnceLock::new();
        INSTANCE.get_or_init(FdRegistry::new)
    }

    /// Look up `fd`, creating the record when `auto_create`. Negative fds
    /// yield None.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdState>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if (fd as usize) < slots.len() {
                if let Some(state) = &slots[fd as usize] {
                    return Some(state.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if (fd as usize) >= slots.len() {
            let new_len = (fd as usize + 1) * 3 / 2;
            slots.resize_with(new_len, || None);
        }
        // Another thread may have won the race between the locks
        if let Some(state) = &slots[fd as usize] {
            return Some(state.clone());
        }
        let state = Arc::new(FdState::new(fd));
        slots[fd as usize] = Some(state.clone());
        Some(state)
    }

    /// Drop the record (hooked close path).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if (fd as usize) < slots.len() {
            slots[fd as usize] = None;
        }
    }
}
