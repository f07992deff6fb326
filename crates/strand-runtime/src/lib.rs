//! # strand-runtime
//!
//! The M:N fiber runtime:
//! - Stackful fibers with hand-written context switching (`fiber`, `arch`)
//! - A multi-threaded cooperative scheduler with optional caller-thread
//!   participation (`scheduler`)
//! - An epoll-backed I/O manager whose idle loop doubles as the reactor,
//!   with a unified timer queue (`iomanager`, `timer`)
//! - The process-wide fd registry tracking socket state and timeouts
//!   (`fd_registry`)
//! - The hook layer that turns blocking syscalls into event registrations
//!   plus fiber yields (`hook`)

pub mod config;
pub mod fd_registry;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

pub mod arch;

// Re-exports
pub use config::{runtime_config, RuntimeConfig};
pub use fd_registry::{FdRegistry, FdState, TimeoutKind};
pub use fiber::{Fiber, FiberState};
pub use iomanager::{Event, IoManager};
pub use scheduler::Scheduler;
pub use thread::Thread;
pub use timer::Timer;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

#[cfg(not(target_os = "linux"))]
compile_error!("strand-runtime requires an edge-triggered epoll; Linux only");
