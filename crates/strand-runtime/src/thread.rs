//! OS thread wrapper
//!
//! `Thread::new` returns only after the child is actually running and has
//! published its kernel tid — a semaphore handshake, so a scheduler can
//! record worker tids before any task is submitted. Thread names and tids
//! are cached thread-locally for logging and affinity checks.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use strand_core::{RtError, RtResult, Semaphore};

thread_local! {
    static THREAD_TID: Cell<libc::pid_t> = const { Cell::new(0) };
    static THREAD_NAME: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Kernel tid of the calling thread, cached after the first syscall.
#[inline]
pub fn current_tid() -> libc::pid_t {
    THREAD_TID.with(|c| {
        let mut tid = c.get();
        if tid == 0 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            c.set(tid);
        }
        tid
    })
}

/// Name of the calling thread as set by the wrapper; empty if unnamed.
pub fn current_thread_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    pub fn new<F>(name: &str, f: F) -> RtResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let started = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(0));

        let started2 = started.clone();
        let tid2 = tid.clone();
        let name2 = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                THREAD_NAME.with(|n| *n.borrow_mut() = name2);
                tid2.store(current_tid(), Ordering::Release);
                started2.post();
                f();
            })
            .map_err(|_| RtError::ThreadSpawnFailed)?;

        started.wait();
        Ok(Thread {
            handle: Some(handle),
            id: tid.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // An unjoined thread is detached, not killed.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_constructor_waits_for_start() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let t = Thread::new("t-start", move || {
            ran2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        // The tid is known as soon as new() returns
        assert!(t.id() > 0);
        t.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_name_visible_inside() {
        let t = Thread::new("t-named", || {
            assert_eq!(current_thread_name(), "t-named");
        })
        .unwrap();
        assert_eq!(t.name(), "t-named");
        t.join();
    }

    #[test]
    fn test_tid_differs_across_threads() {
        let main_tid = current_tid();
        let t = Thread::new("t-tid", move || {
            assert_ne!(current_tid(), main_tid);
        })
        .unwrap();
        t.join();
    }
}
