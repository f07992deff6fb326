//! Stackful fibers
//!
//! A fiber is a cooperatively scheduled execution unit with its own stack.
//! Control moves with `resume` / `yield_now`, and the peer of every switch
//! follows the symmetric transfer rule:
//!
//! - a fiber that participates in a scheduler pairs with the thread's
//!   *scheduling* fiber,
//! - any other fiber pairs with the thread's *root* fiber (the implicit
//!   fiber of the thread's original stack, created on first use).
//!
//! This is what lets a scheduler live inside the caller's thread: the root
//! fiber resumes the scheduling fiber, the scheduling fiber resumes task
//! fibers, and task yields come back to the scheduling fiber — while side
//! fibers created directly by the user still return to the root.
//!
//! State machine: `Ready → Running → (Ready | Term)`. Resuming a Running or
//! Term fiber aborts; so does yielding a fiber that is neither Running nor
//! Term. An entry function that returns lands in `fiber_finished`, which
//! marks Term and yields one last time. Panics escaping an entry abort the
//! process (the trampoline frame is `extern "C"`); error handling inside a
//! fiber is the user's job.

use crate::config::runtime_config;
use crate::current_arch::{self, Context};
use crate::stack::Stack;
use crate::tls;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use strand_core::sdebug;
use strand_core::RtResult;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Term,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

pub struct Fiber {
    id: u64,
    /// None for root fibers, which run on the thread's original stack
    stack: Option<Stack>,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    run_in_scheduler: bool,
}

// Safety: the state machine guarantees at most one thread executes a fiber
// (and therefore touches `ctx`/`entry`) at any moment; handles on other
// threads only read the atomic state or enqueue the Arc.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a Ready fiber owning its stack. `stack_size == 0` selects the
    /// configured default.
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> RtResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_boxed(Box::new(entry), stack_size, run_in_scheduler)
    }

    pub(crate) fn new_boxed(
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> RtResult<Arc<Fiber>> {
        let size = if stack_size == 0 {
            runtime_config().stack_size
        } else {
            stack_size
        };
        let stack = Stack::alloc(size)?;
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            state: AtomicU8::new(FiberState::Ready as u8),
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(Some(entry)),
            run_in_scheduler,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe {
            current_arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        sdebug!("fiber {}: created", fiber.id);
        Ok(fiber)
    }

    /// The root fiber representing a thread's original stack. Starts out
    /// Running, has no entry and no owned stack.
    fn new_root() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack: None,
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(None),
            run_in_scheduler: false,
        })
    }

    /// The fiber currently executing on this thread, materializing the root
    /// fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let cur = tls::current_fiber();
        if !cur.is_null() {
            // CURRENT always originates from Arc::as_ptr of a live handle
            return unsafe {
                Arc::increment_strong_count(cur);
                Arc::from_raw(cur)
            };
        }
        let root = Self::ensure_root();
        tls::set_current_fiber(Arc::as_ptr(&root));
        root
    }

    fn ensure_root() -> Arc<Fiber> {
        if let Some(root) = tls::root_fiber() {
            return root;
        }
        let root = Self::new_root();
        tls::set_root_fiber(root.clone());
        sdebug!("fiber {}: root created", root.id);
        root
    }

    /// Id of the currently executing fiber, 0 when the thread has none yet.
    pub fn current_id() -> u64 {
        let p = tls::current_fiber();
        if p.is_null() {
            0
        } else {
            unsafe { (*p).id }
        }
    }

    /// Live fibers in the process, root fibers included.
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Transfer control into this fiber. The current context is saved into
    /// the peer slot given by the symmetric transfer rule, so `resume` must
    /// be called from that peer (the scheduling fiber for scheduler fibers,
    /// the thread's root otherwise).
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state != FiberState::Term && state != FiberState::Running,
            "resume on {:?} fiber {}",
            state,
            self.id
        );

        let save = if self.run_in_scheduler {
            let sf = tls::sched_fiber();
            assert!(
                !sf.is_null(),
                "fiber {} participates in a scheduler but none runs on this thread",
                self.id
            );
            unsafe { (*sf).ctx.get() }
        } else {
            let root = Self::ensure_root();
            if tls::current_fiber().is_null() {
                tls::set_current_fiber(Arc::as_ptr(&root));
            }
            unsafe { (*Arc::as_ptr(&root)).ctx.get() }
        };

        tls::set_current_fiber(Arc::as_ptr(self));
        self.set_state(FiberState::Running);
        unsafe { current_arch::context_switch(save, self.ctx.get()) };
        // Back here once the fiber yields or terminates.
    }

    /// Give up the CPU. A Running fiber becomes Ready; a Term fiber makes
    /// its final transfer out. Control moves to the peer per the symmetric
    /// transfer rule.
    pub fn yield_now() {
        let cur_ptr = tls::current_fiber();
        assert!(!cur_ptr.is_null(), "yield outside any fiber");
        let cur = unsafe { &*cur_ptr };
        let state = cur.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield on {:?} fiber {}",
            state,
            cur.id
        );

        let peer: *const Fiber = if cur.run_in_scheduler {
            tls::sched_fiber()
        } else {
            tls::root_fiber_ptr()
        };
        assert!(!peer.is_null(), "fiber {} has no peer to yield to", cur.id);

        tls::set_current_fiber(peer);
        if state != FiberState::Term {
            cur.set_state(FiberState::Ready);
        }
        unsafe { current_arch::context_switch(cur.ctx.get(), (*peer).ctx.get()) };
        // Resumed.
    }

    /// Re-arm a finished fiber with a new entry, reusing its stack.
    pub fn reset<F>(self: &Arc<Self>, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(self: &Arc<Self>, entry: Box<dyn FnOnce() + Send>) {
        assert!(self.stack.is_some(), "reset on a root fiber");
        assert_eq!(self.state(), FiberState::Term, "reset on a live fiber {}", self.id);
        unsafe {
            *self.entry.get() = Some(entry);
            current_arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // A stacked fiber may only be destroyed once it has finished.
            assert_eq!(self.state(), FiberState::Term, "drop of live fiber {}", self.id);
        } else if std::ptr::eq(tls::current_fiber(), self) {
            tls::set_current_fiber(std::ptr::null());
        }
        sdebug!("fiber {}: dropped", self.id);
    }
}

/// Invoked by the arch trampoline on the fiber's own stack.
pub(crate) extern "C" fn fiber_entry(fiber: *const Fiber) {
    let f = unsafe { &*fiber };
    let entry = unsafe { (*f.entry.get()).take() }.expect("fiber entry already consumed");
    entry();
}

/// Reached when an entry function returns: mark Term and make the final
/// transfer back to the peer. Never returns.
pub(crate) extern "C" fn fiber_finished() {
    let cur = tls::current_fiber();
    assert!(!cur.is_null(), "fiber finished with no current fiber");
    let f = unsafe { &*cur };
    f.set_state(FiberState::Term);
    sdebug!("fiber {}: term", f.id);
    Fiber::yield_now();
    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_resume_yield_roundtrip() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let f = Fiber::new(
            move || {
                log2.lock().unwrap().push(1);
                Fiber::yield_now();
                log2.lock().unwrap().push(2);
            },
            0,
            false,
        )
        .unwrap();

        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(Mutex::new(0u64));
        let seen2 = seen.clone();
        let f = Fiber::new(
            move || {
                *seen2.lock().unwrap() = Fiber::current().id();
            },
            0,
            false,
        )
        .unwrap();
        let id = f.id();
        f.resume();
        assert_eq!(*seen.lock().unwrap(), id);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(Mutex::new(0));
        let h1 = hits.clone();
        let f = Fiber::new(move || *h1.lock().unwrap() += 1, 0, false).unwrap();
        f.resume();
        assert_eq!(f.state(), FiberState::Term);

        let h2 = hits.clone();
        f.reset(move || *h2.lock().unwrap() += 10);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(*hits.lock().unwrap(), 11);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Fiber::new(|| {}, 0, false).unwrap();
        let b = Fiber::new(|| {}, 0, false).unwrap();
        assert_ne!(a.id(), b.id());
        a.resume();
        b.resume();
    }

    #[test]
    fn test_nested_side_fibers() {
        // A side fiber resumed from the root can itself yield several times.
        let log = Arc::new(Mutex::new(String::new()));
        let l = log.clone();
        let f = Fiber::new(
            move || {
                for c in ['a', 'b', 'c'] {
                    l.lock().unwrap().push(c);
                    Fiber::yield_now();
                }
            },
            0,
            false,
        )
        .unwrap();
        for _ in 0..3 {
            f.resume();
        }
        assert_eq!(f.state(), FiberState::Ready);
        f.resume(); // loop finishes, entry returns
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), "abc");
    }
}
