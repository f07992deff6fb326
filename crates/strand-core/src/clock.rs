//! Monotonic millisecond clock
//!
//! Deadlines throughout the runtime are absolute milliseconds on this
//! clock. It is anchored to a process-lifetime `Instant`, so wall-clock
//! adjustments never move it.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the clock was first read.
#[inline]
pub fn elapsed_ms() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Nanoseconds elapsed since the clock was first read.
#[inline]
pub fn elapsed_ns() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = elapsed_ms();
        let b = elapsed_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_advances() {
        let a = elapsed_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = elapsed_ns();
        assert!(b > a);
    }
}
