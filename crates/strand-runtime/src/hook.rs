//! Blocking-call interception
//!
//! libc-shaped wrappers that turn would-block syscalls into reactor
//! registrations plus fiber yields. The TCP/HTTP layer calls *only* this
//! module for I/O; nothing above it touches `libc` directly.
//!
//! A per-thread flag gates the slow path. Scheduler workers switch it on;
//! on a thread without it (or without an io manager) every wrapper
//! degrades to the raw call. The fast-path invariant comes from the fd
//! registry: any socket it knows is already non-blocking at the kernel
//! level, so the first attempt never blocks the worker — EAGAIN is the
//! signal to park.
//!
//! Parking protocol: the operation does NOT register its readiness event
//! (or timeout timer) itself. It stashes the registration as a deferred
//! action and yields; the dispatch loop runs the action right after the
//! switch completes. An event can therefore never fire for a fiber whose
//! registers are still being saved.

use crate::fd_registry::{FdRegistry, TimeoutKind, TIMEOUT_NONE};
use crate::fiber::Fiber;
use crate::iomanager::{Event, HandlerTarget, IoManager};
use crate::scheduler::Scheduler;
use crate::timer::Timer;
use crate::tls;
use libc::{c_int, c_uint, c_void, size_t, socklen_t, ssize_t};
use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use strand_core::serror;
use strand_core::RtError;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is the slow path active on this thread?
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle the slow path for this thread. Scheduler workers enable it on
/// entry; user threads may flip it at will.
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

/// Shared state of one parked operation. The canceller (timeout timer or
/// registration failure) stores an errno here before waking the fiber;
/// the waiter reads it to tell a real wakeup from a cancelled one.
#[derive(Default)]
struct IoWait {
    cancelled: AtomicI32,
    timer: Mutex<Option<Timer>>,
}

/// Park the current fiber until `event` fires on `fd`, the timeout
/// expires, or registration fails. Returns false when no io manager
/// drives this thread (the caller falls back to the raw result).
fn park_current(
    fd: c_int,
    event: Event,
    timeout_ms: u64,
    wait: &Arc<IoWait>,
    name: &'static str,
) -> bool {
    let iom_ptr = tls::iomanager();
    if iom_ptr.is_null() {
        return false;
    }

    let fiber = Fiber::current();
    let wait_reg = wait.clone();
    let cond: Weak<dyn Any + Send + Sync> = {
        let as_any: Arc<dyn Any + Send + Sync> = wait.clone();
        Arc::downgrade(&as_any)
    };

    // Both registrations happen after the yield point, on the scheduling
    // fiber, once this fiber's context is fully saved.
    tls::set_post_switch(Box::new(move || {
        let iom = unsafe { &*iom_ptr };
        if timeout_ms != TIMEOUT_NONE {
            let w = wait_reg.clone();
            let timer = iom.add_condition_timer(
                timeout_ms,
                move || {
                    // First canceller wins; late timers find the slot taken
                    if w.cancelled
                        .compare_exchange(0, libc::ETIMEDOUT, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        IoManager::with_current(|m| m.cancel_event(fd, event));
                    }
                },
                cond,
                false,
            );
            *wait_reg.timer.lock().unwrap() = Some(timer);
        }
        if let Err(e) = iom.add_event_with(fd, event, HandlerTarget::Fiber(fiber.clone())) {
            serror!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(t) = wait_reg.timer.lock().unwrap().take() {
                t.cancel();
            }
            let code = match e {
                RtError::EpollCtl(no) => no,
                _ => libc::EINVAL,
            };
            wait_reg.cancelled.store(code, Ordering::SeqCst);
            iom.schedule_fiber(fiber.clone());
        }
    }));
    Fiber::yield_now();

    // Awake again: ready, cancelled, or failed. The timer, if any, is spent.
    if let Some(t) = wait.timer.lock().unwrap().take() {
        t.cancel();
    }
    true
}

/// The shared retry loop of every read/write-family wrapper.
fn do_io<F>(
    fd: c_int,
    name: &'static str,
    event: Event,
    kind: TimeoutKind,
    call: F,
) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !is_enabled() {
        return call();
    }
    let Some(state) = FdRegistry::instance().get(fd, false) else {
        return call();
    };
    if state.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !state.is_socket() || state.user_nonblock() {
        return call();
    }

    let timeout = state.timeout(kind);
    let wait = Arc::new(IoWait::default());
    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park until readiness or timeout, then retry
        if !park_current(fd, event, timeout, &wait, name) {
            return n;
        }
        let cancelled = wait.cancelled.swap(0, Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

// ── sleep family ──

fn sleep_hooked(ms: u64) -> bool {
    let iom_ptr = tls::iomanager();
    if iom_ptr.is_null() {
        return false;
    }
    let fiber = Fiber::current();
    tls::set_post_switch(Box::new(move || {
        let iom = unsafe { &*iom_ptr };
        iom.add_timer(
            ms,
            move || {
                let f = fiber.clone();
                Scheduler::with_current(|s| s.schedule_fiber(f));
            },
            false,
        );
    }));
    Fiber::yield_now();
    true
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if is_enabled() && sleep_hooked(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { libc::sleep(seconds) }
}

pub fn usleep(usec: c_uint) -> c_int {
    if is_enabled() && sleep_hooked(usec as u64 / 1000) {
        return 0;
    }
    unsafe { libc::usleep(usec) }
}

/// # Safety
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if is_enabled() {
        let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
        if sleep_hooked(ms) {
            return 0;
        }
    }
    libc::nanosleep(req, rem)
}

/// Millisecond convenience over the hooked sleep path.
pub fn sleep_ms(ms: u64) {
    if !is_enabled() || !sleep_hooked(ms) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

// ── socket lifecycle ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_enabled() || fd < 0 {
        return fd;
    }
    FdRegistry::instance().get(fd, true);
    fd
}

/// # Safety
/// `addr` must point to `addrlen` readable bytes of sockaddr.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(state) = FdRegistry::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if state.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !state.is_socket() || state.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    // Non-blocking under the covers: 0 = connected, EINPROGRESS = in flight
    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let wait = Arc::new(IoWait::default());
    if !park_current(fd, Event::Write, timeout_ms, &wait, "connect") {
        return n;
    }
    let cancelled = wait.cancelled.swap(0, Ordering::SeqCst);
    if cancelled != 0 {
        set_errno(cancelled);
        return -1;
    }

    // Writable: the handshake finished one way or the other
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// # Safety
/// As `connect_with_timeout`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(
        fd,
        addr,
        addrlen,
        crate::config::runtime_config().connect_timeout_ms,
    )
}

/// # Safety
/// `addr`/`addrlen` follow the accept(2) contract; both may be null.
pub unsafe fn accept(s: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, "accept", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(s, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        FdRegistry::instance().get(fd, true);
    }
    fd
}

// ── read family ──

/// # Safety
/// `buf` must be writable for `count` bytes and stay valid across the
/// suspension.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs, all alive across the
/// suspension.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// # Safety
/// As `read`.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

/// # Safety
/// As `recv`; `src_addr`/`addrlen` follow the recvfrom(2) contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must be a valid msghdr, alive across the suspension.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── write family ──

/// # Safety
/// `buf` must be readable for `count` bytes and stay valid across the
/// suspension.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf, count)
    })
}

/// # Safety
/// As `readv`, with readable buffers.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
/// As `write`.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

/// # Safety
/// As `send`; `to` must be readable for `tolen` bytes.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf, len, flags, to, tolen)
    })
}

/// # Safety
/// As `recvmsg`, with readable buffers.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── fd control ──

pub fn close(fd: c_int) -> c_int {
    if let Some(state) = FdRegistry::instance().get(fd, false) {
        state.set_closed();
        if is_enabled() {
            // Wake every waiter exactly once before the fd goes away
            IoManager::with_current(|iom| {
                iom.cancel_all(fd);
            });
        }
        // Always drop the record: a stale entry would shadow whatever
        // unrelated fd the kernel hands out under this number next.
        FdRegistry::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked fcntl. Only F_SETFL/F_GETFL get special treatment: the user's
/// O_NONBLOCK wish is recorded, while the kernel-side flag stays however
/// the runtime needs it.
///
/// # Safety
/// For commands whose argument is a pointer, `arg` must be that pointer.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg as c_int;
            match FdRegistry::instance().get(fd, false) {
                Some(s) if !s.is_closed() && s.is_socket() => {
                    s.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if s.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    libc::fcntl(fd, cmd, arg)
                }
                _ => libc::fcntl(fd, cmd, arg),
            }
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            match FdRegistry::instance().get(fd, false) {
                Some(s) if !s.is_closed() && s.is_socket() => {
                    if s.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// Hooked ioctl; FIONBIO is folded into the same user-non-blocking
/// bookkeeping as fcntl.
///
/// # Safety
/// `arg` must match what `request` expects.
pub unsafe fn ioctl(fd: c_int, request: libc::c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as libc::c_ulong {
        let on = *(arg as *const c_int) != 0;
        if let Some(s) = FdRegistry::instance().get(fd, false) {
            if !s.is_closed() && s.is_socket() {
                s.set_user_nonblock(on);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
/// Standard getsockopt(2) contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Hooked setsockopt: SO_RCVTIMEO/SO_SNDTIMEO are captured into the fd
/// registry (in ms) so the hook layer can arm its own timers, then passed
/// through.
///
/// # Safety
/// Standard setsockopt(2) contract.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_enabled() && level == libc::SOL_SOCKET {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            if let Some(state) = FdRegistry::instance().get(fd, false) {
                let tv = &*(optval as *const libc::timeval);
                let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
                state.set_timeout(kind, ms);
            }
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_per_thread() {
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        let t = std::thread::spawn(|| is_enabled());
        assert!(!t.join().unwrap(), "flag must not leak across threads");
        set_enabled(false);
    }

    #[test]
    fn test_unhooked_sleep_passthrough() {
        // Flag off: plain thread sleep
        assert!(!is_enabled());
        let start = std::time::Instant::now();
        sleep_ms(20);
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
    }

    #[test]
    fn test_unhooked_close_passthrough() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }
}
