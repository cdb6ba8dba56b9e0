//! Test configuration helpers: fast retries, temp output dirs, fixed memory probes

use std::path::Path;
use std::time::Duration;
use tilecraft::config::RetryConfig;
use tilecraft::{Config, MemoryProbe};

/// Retry settings that finish in milliseconds
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        min_delay: Duration::from_millis(1),
        jitter: false,
    }
}

/// Configuration writing everything under `base_dir` with millisecond-scale delays
///
/// Endpoints point at `endpoints` (usually wiremock servers); the tile builder
/// is whatever `tool_path` the caller sets afterwards.
pub fn test_config(base_dir: &Path, endpoints: Vec<String>) -> Config {
    let mut config = Config::default();
    config.output.base_dir = base_dir.to_path_buf();

    config.fetch.endpoints = endpoints;
    config.fetch.request_timeout = Duration::from_millis(500);
    config.fetch.min_request_interval = Duration::ZERO;
    config.fetch.rate_limit_wait = Duration::from_millis(10);
    config.fetch.rate_limit_increment = Duration::from_millis(5);
    config.fetch.retry = fast_retry(4);

    config.process.retry = fast_retry(3);
    config.process.timeout = Duration::from_secs(20);
    config.process.memory_check_interval = Duration::from_millis(50);
    config.process.memory_poll_step = Duration::from_millis(10);
    config.process.termination_grace = Duration::from_millis(500);

    config.validation.retry_delay = Duration::from_millis(10);

    config.tiles.min_zoom = 0;
    config.tiles.max_zoom = 5;
    config
}

/// Memory probe reporting a constant reading
#[derive(Debug)]
pub struct FixedProbe {
    pub used_percent: f64,
    pub available_bytes: Option<u64>,
}

impl FixedProbe {
    /// A machine with plenty of headroom
    pub fn relaxed() -> Self {
        Self {
            used_percent: 30.0,
            available_bytes: Some(1024 * 1024 * 1024),
        }
    }

    /// A machine past the critical threshold
    pub fn critical() -> Self {
        Self {
            used_percent: 99.0,
            available_bytes: Some(64 * 1024 * 1024),
        }
    }
}

impl MemoryProbe for FixedProbe {
    fn used_percent(&self) -> Option<f64> {
        Some(self.used_percent)
    }

    fn available_bytes(&self) -> Option<u64> {
        self.available_bytes
    }
}
