//! Timer queue
//!
//! One-shot and recurring timers ordered strictly by (deadline, id) on the
//! monotonic millisecond clock. Conditional timers gate their callback on a
//! weak sentinel owned by the creator — if the sentinel is gone by the
//! deadline, the callback silently does not run.
//!
//! The queue itself does no waiting. The io manager asks for
//! `next_timeout_ms()` to bound its epoll_wait and drains due callbacks
//! with `collect_expired` afterwards; a front-insertion observer lets it
//! shorten a wait already in progress.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use strand_core::clock;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Notified when a newly inserted timer became the earliest deadline.
pub(crate) trait TimerObserver: Send + Sync {
    fn on_front_inserted(&self);
}

#[derive(Clone, Copy)]
pub(crate) struct ObserverRef(pub *const (dyn TimerObserver + Send + Sync));

// Safety: the observer outlives the queue (the io manager owns both and
// joins its workers before dropping either).
unsafe impl Send for ObserverRef {}
unsafe impl Sync for ObserverRef {}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// A monotonic reading this far behind the previous one is treated as a
/// clock rollover and flushes every timer. Unreachable under a strictly
/// monotonic source; kept as a safety net.
const ROLLOVER_SLACK_MS: u64 = 60 * 60 * 1000;

struct TimerEntry {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

struct TimerInner {
    /// (deadline_ms, id) -> entry
    timers: BTreeMap<(u64, u64), TimerEntry>,
    /// id -> current deadline, for handle operations
    deadlines: HashMap<u64, u64>,
    /// Set when the front was reported; cleared when the owner re-reads
    /// `next_timeout_ms`, so it is told again next time the front moves.
    tickled: bool,
    prev_time_ms: u64,
    observer: Option<ObserverRef>,
}

pub(crate) struct TimerQueue {
    inner: Arc<RwLock<TimerInner>>,
}

/// Handle to a queued timer. Cheap to clone; operations return false once
/// the timer has fired (non-recurring), been cancelled, or outlived its
/// queue.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    inner: Weak<RwLock<TimerInner>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            inner: Arc::new(RwLock::new(TimerInner {
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
                tickled: false,
                prev_time_ms: clock::elapsed_ms(),
                observer: None,
            })),
        }
    }

    pub(crate) fn set_observer(&self, obs: ObserverRef) {
        self.inner.write().unwrap().observer = Some(obs);
    }

    /// Queue `cb` to run `ms` milliseconds from now.
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = clock::elapsed_ms() + ms;
        let entry = TimerEntry {
            period_ms: ms,
            recurring,
            cb,
        };

        let (at_front, obs) = {
            let mut g = self.inner.write().unwrap();
            let at_front = insert_locked(&mut g, id, deadline, entry);
            (at_front, g.observer)
        };
        if at_front {
            if let Some(o) = obs {
                unsafe { &*o.0 }.on_front_inserted();
            }
        }

        Timer {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queue `cb`, but only run it while `cond` still upgrades.
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: TimerCallback,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer {
        let gated: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, gated, recurring)
    }

    /// Milliseconds until the earliest deadline: `u64::MAX` when the queue
    /// is empty, 0 when something is already due.
    pub fn next_timeout_ms(&self) -> u64 {
        let mut g = self.inner.write().unwrap();
        g.tickled = false;
        match g.timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = clock::elapsed_ms();
                deadline.saturating_sub(now)
            }
        }
    }

    /// Drain every timer with deadline <= now, appending callbacks to `out`
    /// in deadline order. Recurring timers are reinserted at now + period.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = clock::elapsed_ms();
        {
            let g = self.inner.read().unwrap();
            if g.timers.is_empty() {
                return;
            }
        }
        let mut g = self.inner.write().unwrap();
        if g.timers.is_empty() {
            return;
        }
        let rollover = detect_rollover(&mut g, now);
        let first = *g.timers.keys().next().unwrap();
        if !rollover && first.0 > now {
            return;
        }

        let remaining = if rollover {
            BTreeMap::new()
        } else {
            g.timers.split_off(&(now + 1, 0))
        };
        let expired = std::mem::replace(&mut g.timers, remaining);

        out.reserve(expired.len());
        for ((_deadline, id), entry) in expired {
            g.deadlines.remove(&id);
            out.push(entry.cb.clone());
            if entry.recurring {
                let next = now + entry.period_ms;
                g.timers.insert((next, id), entry);
                g.deadlines.insert(id, next);
            }
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }
}

fn insert_locked(g: &mut TimerInner, id: u64, deadline: u64, entry: TimerEntry) -> bool {
    g.timers.insert((deadline, id), entry);
    g.deadlines.insert(id, deadline);
    let at_front = g.timers.keys().next() == Some(&(deadline, id)) && !g.tickled;
    if at_front {
        g.tickled = true;
    }
    at_front
}

fn detect_rollover(g: &mut TimerInner, now: u64) -> bool {
    let rolled = now < g.prev_time_ms && now + ROLLOVER_SLACK_MS < g.prev_time_ms;
    g.prev_time_ms = now;
    rolled
}

impl Timer {
    /// Remove the timer without running its callback.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut g = inner.write().unwrap();
        let Some(deadline) = g.deadlines.remove(&self.id) else {
            return false;
        };
        g.timers.remove(&(deadline, self.id));
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut g = inner.write().unwrap();
        let Some(&deadline) = g.deadlines.get(&self.id) else {
            return false;
        };
        let Some(entry) = g.timers.remove(&(deadline, self.id)) else {
            return false;
        };
        let next = clock::elapsed_ms() + entry.period_ms;
        g.timers.insert((next, self.id), entry);
        g.deadlines.insert(self.id, next);
        true
    }

    /// Change the period. The new deadline counts from now when `from_now`,
    /// otherwise from the timer's original start. Resetting to the current
    /// period with `from_now == false` is a no-op.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut g = inner.write().unwrap();
        let Some(&deadline) = g.deadlines.get(&self.id) else {
            return false;
        };
        {
            let Some(entry) = g.timers.get(&(deadline, self.id)) else {
                return false;
            };
            if entry.period_ms == period_ms && !from_now {
                return true;
            }
        }
        let mut entry = g.timers.remove(&(deadline, self.id)).unwrap();
        let start = if from_now {
            clock::elapsed_ms()
        } else {
            deadline.saturating_sub(entry.period_ms)
        };
        entry.period_ms = period_ms;
        let (at_front, obs) = {
            let at_front = insert_locked(&mut g, self.id, start + period_ms, entry);
            (at_front, g.observer)
        };
        drop(g);
        if at_front {
            if let Some(o) = obs {
                unsafe { &*o.0 }.on_front_inserted();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimerCallback {
        let log = log.clone();
        Arc::new(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_next_timeout() {
        let q = TimerQueue::new();
        assert_eq!(q.next_timeout_ms(), u64::MAX);
        let _t = q.add_timer(50, Arc::new(|| {}), false);
        let t = q.next_timeout_ms();
        assert!(t <= 50, "t = {}", t);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(q.next_timeout_ms(), 0);
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let q = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = q.add_timer(20, recorder(&log, 20), false);
        let _b = q.add_timer(5, recorder(&log, 5), false);
        let _c = q.add_timer(10, recorder(&log, 10), false);
        thread::sleep(Duration::from_millis(40));

        let mut cbs = Vec::new();
        q.collect_expired(&mut cbs);
        assert_eq!(cbs.len(), 3);
        for cb in &cbs {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![5, 10, 20]);
        assert!(!q.has_timers());
    }

    #[test]
    fn test_cancel() {
        let q = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = q.add_timer(5, recorder(&log, 1), false);
        assert!(t.cancel());
        assert!(!t.cancel());
        thread::sleep(Duration::from_millis(15));
        let mut cbs = Vec::new();
        q.collect_expired(&mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_recurring_reinserts() {
        let q = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = q.add_timer(5, recorder(&log, 1), true);
        thread::sleep(Duration::from_millis(15));

        let mut cbs = Vec::new();
        q.collect_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(q.has_timers(), "recurring timer must be requeued");
        assert!(t.cancel());
        assert!(!q.has_timers());
    }

    #[test]
    fn test_condition_gate() {
        let q = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sentinel: Arc<dyn Any + Send + Sync> = Arc::new(());
        let _t = q.add_condition_timer(1, recorder(&log, 9), Arc::downgrade(&sentinel), false);
        drop(sentinel);
        thread::sleep(Duration::from_millis(10));

        let mut cbs = Vec::new();
        q.collect_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        cbs[0]();
        assert!(log.lock().unwrap().is_empty(), "gated callback must not run");
    }

    #[test]
    fn test_reset_noop_and_refresh() {
        let q = TimerQueue::new();
        let t = q.add_timer(500, Arc::new(|| {}), false);
        // Same period, not from now: no-op but reported ok
        assert!(t.reset(500, false));
        assert!(t.refresh());
        assert!(t.reset(1000, true));
        let next = q.next_timeout_ms();
        assert!(next > 500 && next <= 1000, "next = {}", next);
        assert!(t.cancel());
    }

    #[test]
    fn test_handle_outlives_queue() {
        let q = TimerQueue::new();
        let t = q.add_timer(1000, Arc::new(|| {}), false);
        drop(q);
        assert!(!t.cancel());
        assert!(!t.refresh());
        assert!(!t.reset(1, true));
    }
}
