//! Epoll-backed I/O manager
//!
//! A scheduler whose idle fiber is the reactor: it blocks in `epoll_wait`
//! bounded by the next timer deadline, drains due timers, fires ready fd
//! handlers back onto their owning schedulers, and yields so the dispatch
//! loop can run what it just queued.
//!
//! Registrations are one-shot: firing an event removes it from both the
//! fd's mask and the epoll interest set. Code that wants level-style
//! persistence re-registers after each wakeup — which is exactly what the
//! hook layer's retry loop does.
//!
//! A self-pipe wakes workers parked in `epoll_wait` when new work arrives
//! (`tickle`); the write side is called bare — a one-byte pipe write is
//! atomic and coalesces.

use crate::fiber::{Fiber, FiberState};
use crate::hook::errno;
use crate::scheduler::{Reactor, ReactorRef, SchedPtr, Scheduler};
use crate::timer::{ObserverRef, Timer, TimerCallback, TimerObserver, TimerQueue};
use crate::tls;
use crate::config::runtime_config;
use std::any::Any;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use strand_core::{sdebug, serror, swarn, RtError, RtResult};

/// Readiness interest on an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    #[inline]
    fn bit(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

pub(crate) enum HandlerTarget {
    /// Resume this fiber when the event fires
    Fiber(Arc<Fiber>),
    /// Run this callback when the event fires
    Call(Box<dyn FnOnce() + Send>),
}

struct EventHandler {
    /// Scheduler the handler is queued onto when fired — the scheduler of
    /// the registering thread, which may differ from the polling manager's.
    scheduler: SchedPtr,
    target: HandlerTarget,
}

#[derive(Default)]
struct FdEvents {
    /// Union of the registered event bits
    registered: u32,
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

impl FdEvents {
    fn handler_slot(&mut self, event: Event) -> &mut Option<EventHandler> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Fire one registered event: clear it from the mask and move its
    /// handler onto the owning scheduler's queue. Consumes the
    /// registration.
    fn trigger(&mut self, event: Event) {
        assert!(
            self.registered & event.bit() != 0,
            "trigger of unregistered event {:?}",
            event
        );
        self.registered &= !event.bit();
        let handler = self
            .handler_slot(event)
            .take()
            .expect("registered event without handler");
        let sched = unsafe { &*handler.scheduler.0 };
        match handler.target {
            HandlerTarget::Fiber(f) => sched.schedule_fiber(f),
            HandlerTarget::Call(cb) => sched.schedule_boxed(cb),
        }
    }
}

/// Per-fd slot: the registered mask and up to two handlers, under a
/// fine-grained mutex. Slots are created eagerly and live until the
/// manager is dropped.
struct FdContext {
    fd: RawFd,
    events: Mutex<FdEvents>,
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    /// Count of registered-but-unfired events across all fds
    pending: AtomicUsize,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    timers: TimerQueue,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl IoManager {
    /// Build the manager and start scheduling immediately.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::EpollCreate(errno()));
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(RtError::PipeCreate(e));
        }

        // The pipe's read end wakes epoll_wait on tickle
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLIN as u32 | libc::EPOLLET as u32;
        ev.u64 = fds[0] as u64;
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) } != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(RtError::EpollCtl(e));
        }

        let iom = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            epfd,
            tickle_fds: fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            timers: TimerQueue::new(),
        });
        iom.resize_contexts(32);

        {
            let r: &(dyn Reactor + Send + Sync) = iom.as_ref();
            iom.sched.install_reactor(ReactorRef(r as *const _));
            let o: &(dyn TimerObserver + Send + Sync) = iom.as_ref();
            iom.timers.set_observer(ObserverRef(o as *const _));
        }
        if use_caller {
            tls::set_iomanager(Arc::as_ptr(&iom));
        }

        iom.sched.start();
        Ok(iom)
    }

    /// The io manager driving the calling thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&IoManager) -> R) -> Option<R> {
        let p = tls::iomanager();
        if p.is_null() {
            None
        } else {
            Some(f(unsafe { &*p }))
        }
    }

    /// Registered-but-unfired event count (observability, tests).
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // ── fd slots ──

    fn resize_contexts(&self, size: usize) {
        let mut slots = self.contexts.write().unwrap();
        let old = slots.len();
        if size <= old {
            return;
        }
        slots.resize_with(size, || None);
        for (fd, slot) in slots.iter_mut().enumerate().skip(old) {
            *slot = Some(Arc::new(FdContext {
                fd: fd as RawFd,
                events: Mutex::new(FdEvents::default()),
            }));
        }
    }

    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let slots = self.contexts.read().unwrap();
            if (fd as usize) < slots.len() {
                return slots[fd as usize].as_ref().unwrap().clone();
            }
        }
        self.resize_contexts((fd as usize + 1) * 3 / 2);
        self.contexts.read().unwrap()[fd as usize]
            .as_ref()
            .unwrap()
            .clone()
    }

    fn try_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let slots = self.contexts.read().unwrap();
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    // ── event registration ──

    /// Register interest with the current fiber as handler: when the event
    /// fires (or is cancelled) the fiber is rescheduled.
    pub fn add_event(&self, fd: RawFd, event: Event) -> RtResult<()> {
        let cur = Fiber::current();
        assert_eq!(
            cur.state(),
            FiberState::Running,
            "add_event from a non-running fiber"
        );
        self.add_event_with(fd, event, HandlerTarget::Fiber(cur))
    }

    /// Register interest with an explicit callback handler.
    pub fn add_event_cb<F>(&self, fd: RawFd, event: Event, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_with(fd, event, HandlerTarget::Call(Box::new(cb)))
    }

    pub(crate) fn add_event_with(
        &self,
        fd: RawFd,
        event: Event,
        target: HandlerTarget,
    ) -> RtResult<()> {
        let ctx = self.context(fd);
        let mut g = ctx.events.lock().unwrap();
        // Double registration of the same (fd, event) is a caller bug
        assert!(
            g.registered & event.bit() == 0,
            "event {:?} already registered for fd {}",
            event,
            fd
        );

        let op = if g.registered != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLET as u32 | g.registered | event.bit();
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = errno();
            let events = ev.events;
            serror!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: errno {}",
                self.epfd,
                op,
                fd,
                events,
                e
            );
            return Err(RtError::EpollCtl(e));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        g.registered |= event.bit();

        // The handler belongs to the scheduler of the registering thread
        let owner = tls::scheduler();
        let owner = if owner.is_null() {
            Arc::as_ptr(&self.sched)
        } else {
            owner
        };
        let slot = g.handler_slot(event);
        debug_assert!(slot.is_none());
        *slot = Some(EventHandler {
            scheduler: SchedPtr(owner),
            target,
        });
        Ok(())
    }

    /// Drop a registration without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut g = ctx.events.lock().unwrap();
        if g.registered & event.bit() == 0 {
            return false;
        }

        let left = g.registered & !event.bit();
        if !self.update_interest(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        g.registered = left;
        *g.handler_slot(event) = None;
        true
    }

    /// Drop a registration and fire it once, as if the event had occurred.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut g = ctx.events.lock().unwrap();
        if g.registered & event.bit() == 0 {
            return false;
        }

        let left = g.registered & !event.bit();
        if !self.update_interest(fd, left) {
            return false;
        }
        g.trigger(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel every registered event on `fd`, firing each once.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut g = ctx.events.lock().unwrap();
        if g.registered == 0 {
            return false;
        }

        if !self.update_interest(fd, 0) {
            return false;
        }
        if g.registered & Event::Read.bit() != 0 {
            g.trigger(Event::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if g.registered & Event::Write.bit() != 0 {
            g.trigger(Event::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert_eq!(g.registered, 0);
        true
    }

    /// Re-point the kernel's interest mask for `fd`; empty mask deletes.
    fn update_interest(&self, fd: RawFd, mask: u32) -> bool {
        let op = if mask != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLET as u32 | mask;
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let events = ev.events;
            serror!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: errno {}",
                self.epfd,
                op,
                fd,
                events,
                errno()
            );
            return false;
        }
        true
    }

    // ── timers ──

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, Arc::new(cb), recurring)
    }

    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, Arc::new(cb), cond, recurring)
    }

    pub fn has_timers(&self) -> bool {
        self.timers.has_timers()
    }

    fn stopping_with_timeout(&self) -> (bool, u64) {
        let next = self.timers.next_timeout_ms();
        let stop = next == u64::MAX
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping();
        (stop, next)
    }
}

impl TimerObserver for IoManager {
    /// A new earliest deadline: shrink the epoll timeout already in flight.
    fn on_front_inserted(&self) {
        self.tickle();
    }
}

impl Reactor for IoManager {
    fn bind_thread(&self) {
        tls::set_iomanager(self as *const _);
    }

    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1) };
        if n < 0 && errno() != libc::EAGAIN {
            swarn!("tickle write failed: errno {}", errno());
        }
    }

    fn stopping(&self) -> bool {
        self.stopping_with_timeout().0
    }

    /// The reactor loop, run as each worker's idle fiber.
    fn idle(&self) {
        sdebug!("iomanager {}: idle", self.sched.name());
        const MAX_EVENTS: usize = 256;
        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
        let mut cbs: Vec<TimerCallback> = Vec::new();

        loop {
            let (stop, next_timeout) = self.stopping_with_timeout();
            if stop {
                sdebug!("iomanager {}: idle stopping exit", self.sched.name());
                break;
            }

            let n = loop {
                let max_idle = runtime_config().max_idle_ms;
                let timeout = if next_timeout != u64::MAX {
                    next_timeout.min(max_idle)
                } else {
                    max_idle
                }
                .min(i32::MAX as u64) as i32;
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout,
                    )
                };
                if rt < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rt.max(0) as usize;
            };

            // Timers first: a timeout-only wakeup must still advance them
            self.timers.collect_expired(&mut cbs);
            for cb in cbs.drain(..) {
                self.sched.schedule(move || cb());
            }

            for ev in events.iter().take(n) {
                let ev = *ev;
                if ev.u64 == self.tickle_fds[0] as u64 {
                    // Edge-triggered: drain the pipe completely
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut _, buf.len())
                    } > 0
                    {}
                    continue;
                }

                let Some(ctx) = self.try_context(ev.u64 as RawFd) else {
                    continue;
                };
                let mut g = ctx.events.lock().unwrap();

                // Hangup/error counts as both directions, else a waiter on
                // the other direction would never fire
                let mut happened = ev.events;
                if happened & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    happened |=
                        (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & g.registered;
                }
                let mut real = 0u32;
                if happened & libc::EPOLLIN as u32 != 0 {
                    real |= Event::Read.bit();
                }
                if happened & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::Write.bit();
                }
                if g.registered & real == 0 {
                    continue;
                }

                // Strip delivered events; re-register the residue
                let left = g.registered & !real;
                if !self.update_interest(ctx.fd, left) {
                    continue;
                }
                if real & Event::Read.bit() != 0 {
                    g.trigger(Event::Read);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real & Event::Write.bit() != 0 {
                    g.trigger(Event::Write);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let the dispatch loop run what was just queued
            Fiber::yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        if std::ptr::eq(tls::iomanager(), self) {
            tls::set_iomanager(std::ptr::null());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) },
            0
        );
        (fds[0], fds[1])
    }

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_read_event_fires_on_data() {
        let iom = IoManager::new(1, false, "io-read").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_cb(r, Event::Read, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) },
            1
        );
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_del_event_does_not_fire() {
        let iom = IoManager::new(1, false, "io-del").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_cb(r, Event::Read, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(iom.del_event(r, Event::Read));
        assert_eq!(iom.pending_events(), 0);

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) },
            1
        );
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_cancel_event_fires_once() {
        let iom = IoManager::new(1, false, "io-cancel").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_cb(r, Event::Read, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(iom.cancel_event(r, Event::Read));
        assert!(!iom.cancel_event(r, Event::Read), "second cancel is a no-op");
        assert_eq!(iom.pending_events(), 0);

        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));
        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_reader_and_writer_are_independent() {
        let iom = IoManager::new(1, false, "io-both").unwrap();
        let (r, w) = pipe_pair();

        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let rr = reads.clone();
        let ww = writes.clone();
        // Register both directions on the pipe's read end: only READ may
        // ever fire by itself.
        iom.add_event_cb(r, Event::Read, move || {
            rr.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        iom.add_event_cb(w, Event::Write, move || {
            ww.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_events(), 2);

        // The write end of an empty pipe is immediately writable
        assert!(wait_until(2000, || writes.load(Ordering::SeqCst) == 1));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(iom.pending_events(), 1);

        // Cancelling the reader does not disturb the (already fired) writer
        assert!(iom.cancel_event(r, Event::Read));
        assert!(wait_until(2000, || reads.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_timer_fires_via_idle_loop() {
        let iom = IoManager::new(1, false, "io-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        iom.add_timer(
            50,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));
        assert!(start.elapsed() >= Duration::from_millis(45));
        iom.stop();
    }

    #[test]
    fn test_recurring_timer_cancels_itself() {
        let iom = IoManager::new(1, false, "io-recur").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let timer: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let t2 = timer.clone();
        let t = iom.add_timer(
            20,
            move || {
                let n = h.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 5 {
                    t2.lock().unwrap().take().unwrap().cancel();
                }
            },
            true,
        );
        *timer.lock().unwrap() = Some(t);

        assert!(wait_until(3000, || hits.load(Ordering::SeqCst) >= 5));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 5, "no sixth invocation");
        iom.stop();
    }
}
