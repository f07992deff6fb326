//! # strand-core
//!
//! Leaf utilities shared by the strand runtime crates:
//! - Error types (`RtError`, `RtResult`)
//! - Environment variable parsing with defaults (`env_get`, `env_get_bool`)
//! - Leveled stderr logging macros (`serror!` .. `strace!`)
//! - A spinlock for short, syscall-free critical sections
//! - A counting semaphore for thread startup handshakes
//! - The monotonic millisecond clock the timer queue runs on

pub mod clock;
pub mod env;
pub mod error;
pub mod logging;
pub mod semaphore;
pub mod spinlock;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{RtError, RtResult};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
