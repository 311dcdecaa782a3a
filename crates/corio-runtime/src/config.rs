//! Runtime configuration.
//!
//! # Environment Variables
//!
//! - `CORIO_MAX_INFLIGHT` - soft cap on in-flight I/O operations (ring size)
//! - `CORIO_WORKERS` - worker thread count for pool contexts
//! - `CORIO_BUF_SIZE` - default buffer size for the demo binaries

use corio_core::env::env_get;

/// Tunables shared by the service and the contexts.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Soft cap on in-flight operations. Sizes the kernel submission
    /// queue; the service may exceed it without deadlocking.
    pub max_inflight: u32,
    /// Worker threads for pool contexts.
    pub worker_threads: usize,
    /// Default buffer size for stream I/O.
    pub default_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_inflight: 256,
            worker_threads: 1,
            default_buffer_size: 4 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_inflight: env_get("CORIO_MAX_INFLIGHT", d.max_inflight),
            worker_threads: env_get("CORIO_WORKERS", d.worker_threads),
            default_buffer_size: env_get("CORIO_BUF_SIZE", d.default_buffer_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.max_inflight, 256);
        assert_eq!(c.worker_threads, 1);
        assert_eq!(c.default_buffer_size, 4096);
    }
}
