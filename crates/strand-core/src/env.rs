//! Environment variable parsing with defaults
//!
//! All runtime knobs are read through these helpers so a missing or
//! malformed variable silently falls back to the built-in default.
//!
//! ```ignore
//! let stack: usize = env_get("STRAND_STACK_SIZE", 128 * 1024);
//! let flush = env_get_bool("STRAND_LOG_FLUSH", false);
//! ```

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default` when the
/// variable is unset or does not parse.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable as a boolean.
///
/// "1", "true", "yes" and "on" (case-insensitive) read as true; any other
/// set value reads as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse an environment variable as `Option<T>`; `None` when unset or unparseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let v: u64 = env_get("__STRAND_TEST_NOT_SET__", 7);
        assert_eq!(v, 7);
        assert!(env_get_bool("__STRAND_TEST_NOT_SET__", true));
        assert_eq!(env_get_opt::<u64>("__STRAND_TEST_NOT_SET__"), None);
    }

    #[test]
    fn test_set_and_parse() {
        std::env::set_var("__STRAND_TEST_NUM__", "4096");
        let v: usize = env_get("__STRAND_TEST_NUM__", 1);
        assert_eq!(v, 4096);
        std::env::remove_var("__STRAND_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for s in ["1", "true", "YES", "on"] {
            std::env::set_var("__STRAND_TEST_BOOL__", s);
            assert!(env_get_bool("__STRAND_TEST_BOOL__", false), "{}", s);
        }
        std::env::set_var("__STRAND_TEST_BOOL__", "nope");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::remove_var("__STRAND_TEST_BOOL__");
    }

    #[test]
    fn test_parse_failure_falls_back() {
        std::env::set_var("__STRAND_TEST_BAD__", "not-a-number");
        let v: u32 = env_get("__STRAND_TEST_BAD__", 42);
        assert_eq!(v, 42);
        std::env::remove_var("__STRAND_TEST_BAD__");
    }
}
