//! Fiber scheduler
//!
//! N worker threads drain a shared FIFO of tasks (fibers or plain
//! callables, each with optional thread affinity). With `use_caller` the
//! creating thread counts as one worker: its scheduling fiber is built up
//! front and `stop()` resumes it to drain whatever work remains.
//!
//! When the queue is empty a worker runs its idle fiber. The base idle
//! fiber just yields until quiescence; an installed reactor (the io
//! manager) replaces it with an epoll wait and also takes over `tickle`
//! and the quiescence test.
//!
//! A task fiber that suspends mid-I/O must not become visible to other
//! workers before its registers are fully saved. Hooked operations
//! therefore stash their event/timer registration as a deferred action
//! (`tls::set_post_switch`) and the dispatch loop runs it right after
//! `resume` returns — strictly after the switch — so nothing can fire for
//! a fiber that is still leaving the CPU, and the queue never holds a
//! Running fiber.

use crate::fiber::{Fiber, FiberState};
use crate::thread::{self, Thread};
use crate::tls;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use strand_core::{sdebug, serror, SpinLock};

/// Raw scheduler pointer for worker closures and event handlers.
///
/// Safety contract: a scheduler joins its workers in `stop()` before it can
/// be dropped, so the pointer outlives every closure holding it.
#[derive(Clone, Copy)]
pub(crate) struct SchedPtr(pub *const Scheduler);

unsafe impl Send for SchedPtr {}
unsafe impl Sync for SchedPtr {}

/// The io manager's face toward the scheduler.
pub(crate) trait Reactor: Send + Sync {
    /// Publish this reactor in the worker's thread-local state.
    fn bind_thread(&self);
    /// Wake one worker blocked in the idle wait.
    fn tickle(&self);
    /// Full quiescence test, including reactor-owned work.
    fn stopping(&self) -> bool;
    /// Body of the idle fiber: wait, dispatch, yield; return at quiescence.
    fn idle(&self);
}

#[derive(Clone, Copy)]
pub(crate) struct ReactorRef(pub *const (dyn Reactor + Send + Sync));

unsafe impl Send for ReactorRef {}
unsafe impl Sync for ReactorRef {}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    kind: TaskKind,
    /// Kernel tid of the worker that must run this, -1 for any
    thread: libc::pid_t,
}

pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: SpinLock<Vec<libc::pid_t>>,
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    use_caller: bool,
    /// Tid of the caller thread when `use_caller`, else -1
    root_thread: libc::pid_t,
    /// The caller thread's scheduling fiber, resumed by `stop()`
    caller_fiber: OnceLock<Arc<Fiber>>,
    reactor: OnceLock<ReactorRef>,
}

impl Scheduler {
    /// Prepare a scheduler; workers are not spawned until `start()`.
    ///
    /// With `use_caller` the calling thread is counted as one of `threads`
    /// and becomes this scheduler's home: only it may call `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0);

        let (thread_count, root_thread) = if use_caller {
            (threads - 1, thread::current_tid())
        } else {
            (threads, -1)
        };

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: SpinLock::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            use_caller,
            root_thread,
            caller_fiber: OnceLock::new(),
            reactor: OnceLock::new(),
        });

        if use_caller {
            // Materialize this thread's root fiber before any switching
            Fiber::current();
            assert!(
                tls::scheduler().is_null(),
                "thread already participates in a scheduler"
            );
            tls::set_scheduler(Arc::as_ptr(&sched));

            let sp = SchedPtr(Arc::as_ptr(&sched));
            let caller = Fiber::new(
                move || {
                    let sp = sp;
                    unsafe { &*sp.0 }.run()
                },
                0,
                false,
            )
                .expect("caller scheduling fiber");
            tls::set_sched_fiber(Arc::as_ptr(&caller));
            let _ = sched.caller_fiber.set(caller);
            sched.thread_ids.lock().push(root_thread);
        }

        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tids of all participating threads (affinity targets).
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().clone()
    }

    /// The scheduler driving the calling thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
        let p = tls::scheduler();
        if p.is_null() {
            None
        } else {
            Some(f(unsafe { &*p }))
        }
    }

    /// Spawn the worker threads.
    pub fn start(self: &Arc<Self>) {
        sdebug!("scheduler {}: start", self.name);
        let mut threads = self.threads.lock().unwrap();
        if self.stopping.load(Ordering::SeqCst) {
            serror!("scheduler {}: start after stop", self.name);
            return;
        }
        assert!(threads.is_empty());
        for i in 0..self.thread_count {
            let sp = SchedPtr(Arc::as_ptr(self));
            let t = Thread::new(&format!("{}_{}", self.name, i), move || {
                let sp = sp;
                unsafe { &*sp.0 }.run()
            })
            .expect("failed to spawn scheduler worker");
            self.thread_ids.lock().push(t.id());
            threads.push(t);
        }
    }

    // ── task submission ──

    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task {
            kind: TaskKind::Call(Box::new(cb)),
            thread: -1,
        });
    }

    pub fn schedule_on<F>(&self, cb: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task {
            kind: TaskKind::Call(Box::new(cb)),
            thread,
        });
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task {
            kind: TaskKind::Fiber(fiber),
            thread: -1,
        });
    }

    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: libc::pid_t) {
        self.submit(Task {
            kind: TaskKind::Fiber(fiber),
            thread,
        });
    }

    pub(crate) fn schedule_boxed(&self, cb: Box<dyn FnOnce() + Send>) {
        self.submit(Task {
            kind: TaskKind::Call(cb),
            thread: -1,
        });
    }

    fn submit(&self, task: Task) {
        let was_empty = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    // ── state ──

    fn reactor(&self) -> Option<&(dyn Reactor + Send + Sync)> {
        self.reactor.get().map(|r| unsafe { &*r.0 })
    }

    pub(crate) fn install_reactor(&self, r: ReactorRef) {
        let _ = self.reactor.set(r);
    }

    /// Wake a worker stuck in the idle wait. The base scheduler's idle
    /// fiber polls, so this only has to do something once a reactor is
    /// installed.
    pub(crate) fn tickle(&self) {
        match self.reactor() {
            Some(r) => r.tickle(),
            None => sdebug!("scheduler {}: tickle", self.name),
        }
    }

    /// True once the scheduler (and its reactor, if any) is quiescent.
    pub fn stopping(&self) -> bool {
        match self.reactor() {
            Some(r) => r.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Request termination, drain all queued work, join the workers.
    pub fn stop(&self) {
        sdebug!("scheduler {}: stop", self.name);
        if self.stopping() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);

        if self.use_caller {
            assert!(
                std::ptr::eq(tls::scheduler(), self),
                "use_caller stop must come from the caller thread"
            );
        } else {
            assert!(!std::ptr::eq(tls::scheduler(), self));
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.caller_fiber.get().is_some() {
            self.tickle();
        }

        if let Some(caller) = self.caller_fiber.get() {
            // Run the dispatch loop here until quiescence
            caller.resume();
            sdebug!("scheduler {}: caller fiber end", self.name);
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            t.join();
        }
    }

    // ── the dispatch loop ──

    pub(crate) fn run(&self) {
        sdebug!("scheduler {}: run on tid {}", self.name, thread::current_tid());
        crate::hook::set_enabled(true);
        tls::set_scheduler(self as *const _);

        let tid = thread::current_tid();
        if tid != self.root_thread {
            // Worker thread: the root fiber doubles as the scheduling fiber
            let root = Fiber::current();
            tls::set_sched_fiber(Arc::as_ptr(&root));
        }
        if let Some(r) = self.reactor() {
            r.bind_thread();
        }

        let idle_fiber = match self.reactor.get() {
            Some(&r) => Fiber::new(
                move || {
                    let r = r;
                    unsafe { &*r.0 }.idle()
                },
                0,
                true,
            ),
            None => {
                let sp = SchedPtr(self as *const _);
                Fiber::new(
                    move || {
                        let sp = sp;
                        let sched = unsafe { &*sp.0 };
                        while !sched.base_stopping() {
                            Fiber::yield_now();
                        }
                    },
                    0,
                    true,
                )
            }
        }
        .expect("idle fiber");
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut q = self.tasks.lock().unwrap();
                let mut pick = None;
                for (i, t) in q.iter().enumerate() {
                    if t.thread != -1 && t.thread != tid {
                        // Pinned to another worker; make sure someone wakes it
                        tickle_me = true;
                        continue;
                    }
                    pick = Some(i);
                    break;
                }
                if let Some(i) = pick {
                    task = q.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    tickle_me |= !q.is_empty();
                }
            }
            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(f)) => {
                    f.resume();
                    tls::run_post_switch();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskKind::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::new_boxed(cb, 0, true).expect("callback fiber"),
                    };
                    f.resume();
                    tls::run_post_switch();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    if f.state() == FiberState::Term {
                        // Keep the finished fiber for the next callable
                        cb_fiber = Some(f);
                    }
                    // A callable that yielded re-enters through an explicit
                    // schedule call; its fiber cannot be reused here.
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        sdebug!("scheduler {}: idle fiber term", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    tls::run_post_switch();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        sdebug!("scheduler {}: run exit on tid {}", self.name, tid);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        sdebug!("scheduler {}: drop", self.name);
        if !self.stopping.load(Ordering::SeqCst) {
            self.stop();
        }
        if std::ptr::eq(tls::scheduler(), self) {
            tls::set_scheduler(std::ptr::null());
            tls::set_sched_fiber(std::ptr::null());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn test_caller_thread_drains_on_stop() {
        // threads=1 + use_caller: no extra workers at all
        let sched = Scheduler::new(1, true, "caller");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let c = counter.clone();
            // Schedule-then-yield: the fiber re-enters the queue itself
            // before giving up the CPU, then finishes on second dispatch.
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let me = Fiber::current();
                Scheduler::with_current(|s| s.schedule_fiber(me)).unwrap();
                Fiber::yield_now();
                c.fetch_add(100, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0, "nothing runs before stop");
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16 * 101);
    }

    #[test]
    fn test_worker_threads_dispatch() {
        let sched = Scheduler::new(2, false, "workers");
        sched.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = counter.clone();
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        sched.stop();
    }

    #[test]
    fn test_scheduled_fiber_runs_once() {
        let sched = Scheduler::new(2, false, "fibers");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();
        sched.schedule_fiber(f);

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "dispatched exactly once");
    }

    #[test]
    fn test_thread_affinity_best_effort() {
        let sched = Scheduler::new(2, false, "affinity");
        sched.start();
        let ids = sched.thread_ids();
        assert_eq!(ids.len(), 2);

        let target = ids[0];
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        sched.schedule_on(
            move || {
                s.store(thread::current_tid() as usize, Ordering::SeqCst);
            },
            target,
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.stop();
        assert_eq!(seen.load(Ordering::SeqCst), target as usize);
    }

    #[test]
    fn test_stop_waits_for_queued_work() {
        let sched = Scheduler::new(1, true, "drain");
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let d = done.clone();
            sched.schedule(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }
}
