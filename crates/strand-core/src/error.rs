//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors surfaced by the runtime.
///
/// Programming errors (resuming a running fiber, double event registration)
/// are not represented here; those abort via assertions. These variants cover
/// resource exhaustion and kernel-object failures that callers can react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Fiber stack mmap failed
    StackAllocFailed,

    /// Guard page mprotect failed
    StackProtectFailed,

    /// OS thread creation failed
    ThreadSpawnFailed,

    /// epoll_create failed (errno)
    EpollCreate(i32),

    /// epoll_ctl failed (errno)
    EpollCtl(i32),

    /// pipe creation failed (errno)
    PipeCreate(i32),

    /// Operation requires a running scheduler on this thread
    NoScheduler,
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::StackAllocFailed => write!(f, "fiber stack allocation failed"),
            RtError::StackProtectFailed => write!(f, "fiber guard page protection failed"),
            RtError::ThreadSpawnFailed => write!(f, "failed to spawn worker thread"),
            RtError::EpollCreate(e) => write!(f, "epoll_create failed: errno {}", e),
            RtError::EpollCtl(e) => write!(f, "epoll_ctl failed: errno {}", e),
            RtError::PipeCreate(e) => write!(f, "pipe failed: errno {}", e),
            RtError::NoScheduler => write!(f, "no scheduler running on this thread"),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", RtError::StackAllocFailed),
            "fiber stack allocation failed"
        );
        assert_eq!(format!("{}", RtError::EpollCtl(22)), "epoll_ctl failed: errno 22");
    }

    #[test]
    fn test_is_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&RtError::NoScheduler);
    }
}
