//! Architecture-specific context switching
//!
//! Each submodule provides the same three items:
//! - `Context` — the callee-saved register frame a suspended fiber is
//!   reduced to
//! - `init_context` — prime a frame so the first switch lands in the entry
//!   trampoline
//! - `context_switch` — save the current registers into one frame and
//!   restore another
//!
//! Everything above this module treats the switch as an opaque capability.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
