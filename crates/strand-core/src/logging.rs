//! Leveled stderr logging for the runtime
//!
//! Printk-style macros over a locked stderr handle. The level and flush
//! behaviour are read once from the environment:
//!
//! - `STRAND_LOG_LEVEL` — off|error|warn|info|debug|trace (or 0..5)
//! - `STRAND_LOG_FLUSH` — flush after every line (useful when chasing crashes)
//!
//! The runtime's hot paths log through these rather than a logging crate so
//! that emitting a line never allocates and never takes a foreign lock while
//! a fiber stack is active.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn parse_level(s: &str) -> LogLevel {
    match s.to_lowercase().as_str() {
        "off" | "0" => LogLevel::Off,
        "error" | "1" => LogLevel::Error,
        "warn" | "2" => LogLevel::Warn,
        "info" | "3" => LogLevel::Info,
        "debug" | "4" => LogLevel::Debug,
        "trace" | "5" => LogLevel::Trace,
        _ => LogLevel::Info,
    }
}

/// Initialize from the environment. Called automatically on first log.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(v) = std::env::var("STRAND_LOG_LEVEL") {
        LOG_LEVEL.store(parse_level(&v) as u8, Ordering::Relaxed);
    }
    if let Ok(v) = std::env::var("STRAND_LOG_FLUSH") {
        let on = matches!(v.as_str(), "1" | "true" | "yes" | "on");
        FLUSH.store(on, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line writer. Holds the stderr lock so a line is emitted
/// atomically even when workers log concurrently.
#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! serror {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! swarn {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! sinfo {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! sdebug {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! strace {
    ($($arg:tt)*) => {{
        $crate::logging::_log_impl($crate::logging::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Trace);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warn"), LogLevel::Warn);
        assert_eq!(parse_level("5"), LogLevel::Trace);
        assert_eq!(parse_level("garbage"), LogLevel::Info);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        serror!("e {}", 1);
        swarn!("w");
        sinfo!("i");
        sdebug!("d");
        strace!("t");
    }
}
