//! System memory sampling and the run-time memory monitor
//!
//! The monitor is an independent task. It samples memory every check
//! interval, sleeping in short steps so cancellation takes effect promptly,
//! logs one warning above the soft threshold and raises a one-way abort
//! signal above the hard threshold.

use crate::types::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Source of system memory figures
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    /// Used memory as a percentage of total (0-100), None if unavailable
    fn used_percent(&self) -> Option<f64>;

    /// Bytes available for new allocations, None if unavailable
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads `/proc/meminfo` on Linux; reports nothing elsewhere
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemoryProbe;

/// Total and available memory in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemInfo {
    /// MemTotal
    pub total: u64,
    /// MemAvailable
    pub available: u64,
}

impl MemInfo {
    /// Used memory percentage
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let used = self.total.saturating_sub(self.available);
        used as f64 / self.total as f64 * 100.0
    }
}

/// Parse the `MemTotal` and `MemAvailable` lines of a meminfo document
pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        // Format: "MemTotal:       16384000 kB"
        let mut parts = line.split_whitespace();
        let field = parts.next();
        let kb = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (field, kb) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb * 1024),
            (Some("MemAvailable:"), Some(kb)) => available = Some(kb * 1024),
            _ => {}
        }
    }

    Some(MemInfo {
        total: total?,
        available: available?,
    })
}

impl SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn read() -> Option<MemInfo> {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo(&content))
    }

    #[cfg(not(target_os = "linux"))]
    fn read() -> Option<MemInfo> {
        None
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_percent(&self) -> Option<f64> {
        Self::read().map(|m| m.used_percent())
    }

    fn available_bytes(&self) -> Option<u64> {
        Self::read().map(|m| m.available)
    }
}

/// Thresholds and timing for one monitor task
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// Soft threshold (percent): one warning
    pub warning_percent: f64,
    /// Hard threshold (percent): abort the run
    pub critical_percent: f64,
    /// Time between samples
    pub check_interval: Duration,
    /// Sleep granularity between cancellation checks
    pub poll_step: Duration,
}

/// What the monitor observed, returned when it is joined
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitorReport {
    /// Samples taken
    pub samples: u32,
    /// Highest usage seen (percent)
    pub peak_percent: f64,
    /// Whether the soft threshold was crossed
    pub warned: bool,
    /// Usage that triggered the abort, if any
    pub critical: Option<f64>,
}

/// Sample memory until cancelled or the hard threshold is crossed
///
/// On a critical sample the usage is published on `alert` and the task ends.
pub async fn monitor_memory(
    probe: Arc<dyn MemoryProbe>,
    settings: MonitorSettings,
    alert: watch::Sender<Option<f64>>,
    cancel: CancellationToken,
    event_tx: Option<broadcast::Sender<Event>>,
) -> MonitorReport {
    let mut report = MonitorReport::default();
    let step = settings.poll_step.max(Duration::from_millis(1));

    loop {
        let mut slept = Duration::ZERO;
        while slept < settings.check_interval {
            let nap = step.min(settings.check_interval - slept);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(samples = report.samples, "Memory monitoring cancelled");
                    return report;
                }
                _ = tokio::time::sleep(nap) => {}
            }
            slept += nap;
        }

        let Some(percent) = probe.used_percent() else {
            tracing::debug!("Memory usage unavailable, skipping sample");
            continue;
        };

        report.samples += 1;
        if percent > report.peak_percent {
            report.peak_percent = percent;
        }
        if let Some(tx) = &event_tx {
            let _ = tx.send(Event::MemoryUsage { percent });
        }

        if percent > settings.warning_percent && !report.warned {
            report.warned = true;
            tracing::warn!(percent, "High memory usage");
        }

        if percent > settings.critical_percent {
            tracing::error!(percent, "Critical memory usage, aborting run");
            report.critical = Some(percent);
            let _ = alert.send(Some(percent));
            return report;
        }
    }
}
