//! Counting semaphore
//!
//! Used for OS-thread handshakes — most importantly the thread wrapper's
//! "constructor returns only after the child is running" guarantee. This is
//! a kernel-thread primitive; fibers never wait on it.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block the calling OS thread until a permit is available.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Take a permit without blocking. Returns false if none available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Release one permit, waking a waiter if any.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_wait() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn test_cross_thread_handshake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.post();
        });
        sem.wait();
        t.join().unwrap();
    }
}
