//! Runtime configuration
//!
//! A plain struct with environment overrides. The process-wide instance is
//! built lazily on first use; individual knobs can also be set explicitly
//! by embedders that construct their own `RuntimeConfig`.

use strand_core::env_get;

/// Tunables for the fiber runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Fiber stack size in bytes (`STRAND_STACK_SIZE`, default 128 KiB)
    pub stack_size: usize,

    /// Upper bound on one epoll_wait, so the idle loop wakes even when
    /// nothing happens (`STRAND_MAX_IDLE_MS`, default 5000)
    pub max_idle_ms: u64,

    /// Default timeout for hooked connect (`STRAND_CONNECT_TIMEOUT_MS`,
    /// default 5000)
    pub connect_timeout_ms: u64,

    /// Receive timeout assigned to accepted tcp-server connections
    /// (`STRAND_TCP_RECV_TIMEOUT_MS`, default 120_000)
    pub tcp_recv_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            max_idle_ms: 5000,
            connect_timeout_ms: 5000,
            tcp_recv_timeout_ms: 120_000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", d.stack_size),
            max_idle_ms: env_get("STRAND_MAX_IDLE_MS", d.max_idle_ms),
            connect_timeout_ms: env_get("STRAND_CONNECT_TIMEOUT_MS", d.connect_timeout_ms),
            tcp_recv_timeout_ms: env_get("STRAND_TCP_RECV_TIMEOUT_MS", d.tcp_recv_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.stack_size < 16 * 1024 {
            return Err("stack_size must be at least 16 KiB");
        }
        if self.max_idle_ms == 0 {
            return Err("max_idle_ms must be non-zero");
        }
        Ok(())
    }
}

/// The process-wide configuration, read from the environment on first use.
pub fn runtime_config() -> &'static RuntimeConfig {
    use std::sync::OnceLock;
    static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let cfg = RuntimeConfig::from_env();
        cfg.validate().expect("invalid STRAND_* configuration");
        cfg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.stack_size, 128 * 1024);
        assert_eq!(c.max_idle_ms, 5000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_stack() {
        let c = RuntimeConfig {
            stack_size: 1024,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
