//! # strand
//!
//! An M:N server runtime built on stackful fibers: many cooperative
//! fibers multiplexed over a small pool of worker threads, with an epoll
//! reactor in each worker's idle loop and a hook layer that turns
//! blocking-looking syscalls into suspend-and-retry.
//!
//! ```text
//!  user fiber ── read(fd) ──► hook layer
//!                                │ EAGAIN
//!                                ▼
//!                    register READ + timeout timer
//!                    yield to the scheduling fiber
//!                                │
//!          IoManager idle: epoll_wait(next timer deadline)
//!                                │ fd ready / timer fired
//!                                ▼
//!                  reschedule fiber ── retry the syscall
//! ```
//!
//! Quick start:
//!
//! ```ignore
//! use strand::{hook, IoManager};
//!
//! let iom = IoManager::new(2, false, "app").unwrap();
//! iom.schedule(|| {
//!     hook::sleep_ms(100); // suspends the fiber, not the worker
//!     println!("later");
//! });
//! iom.stop();
//! ```

// Runtime
pub use strand_runtime::{
    hook, runtime_config, Event, FdRegistry, FdState, Fiber, FiberState, IoManager,
    RuntimeConfig, Scheduler, Thread, Timer, TimeoutKind,
};

// Networking
pub use strand_net::http;
pub use strand_net::{Address, ByteArray, ClientHandler, Socket, SocketStream, TcpServer};

// Leaf utilities
pub use strand_core::logging::{self, LogLevel};
pub use strand_core::{env_get, env_get_bool, env_get_opt, RtError, RtResult, Semaphore, SpinLock};
pub use strand_core::{sdebug, serror, sinfo, strace, swarn};
