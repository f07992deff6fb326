//! Thread-local runtime state
//!
//! Every OS thread participating in the runtime carries:
//! - the fiber currently executing on it
//! - a strong handle to its root fiber (created lazily on first use)
//! - the scheduling fiber the symmetric transfer rule pairs tasks with
//! - pointers to the scheduler / io manager driving the thread
//! - a one-shot deferred action executed by the scheduling loop right
//!   after a fiber has fully suspended (see `scheduler`)

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static SCHEDULER: Cell<*const Scheduler> = const { Cell::new(std::ptr::null()) };
    static IOMANAGER: Cell<*const IoManager> = const { Cell::new(std::ptr::null()) };
    static POST_SWITCH: RefCell<Option<Box<dyn FnOnce()>>> = const { RefCell::new(None) };
}

// ── current fiber ──

// try_with: the root fiber's Drop runs during thread-local teardown, when
// sibling slots may already be gone.

#[inline]
pub fn current_fiber() -> *const Fiber {
    CURRENT_FIBER
        .try_with(|c| c.get())
        .unwrap_or(std::ptr::null())
}

#[inline]
pub fn set_current_fiber(f: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|c| c.set(f));
}

// ── root fiber ──

pub fn root_fiber() -> Option<Arc<Fiber>> {
    ROOT_FIBER.with(|r| r.borrow().clone())
}

pub fn set_root_fiber(f: Arc<Fiber>) {
    ROOT_FIBER.with(|r| *r.borrow_mut() = Some(f));
}

#[inline]
pub fn root_fiber_ptr() -> *const Fiber {
    ROOT_FIBER.with(|r| {
        r.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .unwrap_or(std::ptr::null())
    })
}

// ── scheduling fiber ──

#[inline]
pub fn sched_fiber() -> *const Fiber {
    SCHED_FIBER.with(|c| c.get())
}

#[inline]
pub fn set_sched_fiber(f: *const Fiber) {
    SCHED_FIBER.with(|c| c.set(f));
}

// ── scheduler / io manager ──

#[inline]
pub fn scheduler() -> *const Scheduler {
    SCHEDULER.with(|c| c.get())
}

#[inline]
pub fn set_scheduler(s: *const Scheduler) {
    SCHEDULER.with(|c| c.set(s));
}

#[inline]
pub fn iomanager() -> *const IoManager {
    IOMANAGER.with(|c| c.get())
}

#[inline]
pub fn set_iomanager(m: *const IoManager) {
    IOMANAGER.with(|c| c.set(m));
}

// ── deferred post-switch action ──

/// Stash an action for the scheduling loop to run once the current fiber
/// has fully left the CPU. At most one may be pending per suspension.
pub fn set_post_switch(f: Box<dyn FnOnce()>) {
    POST_SWITCH.with(|p| {
        let prev = p.borrow_mut().replace(f);
        assert!(prev.is_none(), "post-switch action already pending");
    });
}

/// Run and clear the pending action, if any. Called by the scheduling loop
/// after every resume returns.
pub fn run_post_switch() {
    let f = POST_SWITCH.with(|p| p.borrow_mut().take());
    if let Some(f) = f {
        f();
    }
}
