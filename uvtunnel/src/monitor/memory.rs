//! Process-level accounting of pooled buffer memory.
//!
//! The monitor only observes: it never blocks or denies an allocation. Alerts
//! fire once each time usage crosses the threshold upwards and re-arm when
//! usage drops back below it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::sync::Worker;
use crate::trace::{info, warn};

/// Default alert threshold (100 MiB).
pub const DEFAULT_ALERT_THRESHOLD: u64 = 100 * 1024 * 1024;

/// How often the reporter checks the threshold.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How often the reporter logs usage.
pub const LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Delivered to alert callbacks when usage crosses the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAlert {
    /// Usage at the moment of crossing, in bytes.
    pub current: u64,
    /// Threshold that was crossed, in bytes.
    pub threshold: u64,
}

type AlertCallback = Box<dyn Fn(MemoryAlert) + Send + Sync>;

/// Snapshot of the monitor's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub current: u64,
    pub peak: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub threshold: u64,
}

/// Tracks allocated bytes, peak usage and threshold alerts.
pub struct MemoryMonitor {
    current: AtomicU64,
    peak: AtomicU64,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    threshold: AtomicU64,
    above_threshold: AtomicBool,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_THRESHOLD)
    }
}

impl MemoryMonitor {
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            threshold: AtomicU64::new(threshold),
            above_threshold: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Records `bytes` newly allocated.
    pub fn track_allocation(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.total_allocated.fetch_add(bytes, Ordering::Relaxed);
        let now = self.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.check();
    }

    /// Records `bytes` released.
    pub fn track_deallocation(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.total_freed.fetch_add(bytes, Ordering::Relaxed);
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(bytes))
            });
        self.check();
    }

    /// Registers a callback fired on each upward threshold crossing.
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(MemoryAlert) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    #[cfg(test)]
    pub(crate) fn alert_callback_count(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            current: self.current_usage(),
            peak: self.peak_usage(),
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            threshold: self.threshold(),
        }
    }

    /// Compares usage with the threshold and fires callbacks on an upward crossing.
    ///
    /// Returns true if usage is currently above the threshold.
    pub fn check(&self) -> bool {
        let current = self.current_usage();
        let threshold = self.threshold();
        let above = current > threshold;
        let was_above = self.above_threshold.swap(above, Ordering::AcqRel);
        if above && !was_above {
            warn!(
                current = %format_bytes(current),
                threshold = %format_bytes(threshold),
                "memory usage crossed alert threshold"
            );
            let alert = MemoryAlert { current, threshold };
            for callback in self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
            {
                callback(alert);
            }
        }
        above
    }

    /// Starts the periodic checker/logger thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_reporter(self: &Arc<Self>) -> std::io::Result<Worker> {
        let monitor = Arc::clone(self);
        Worker::spawn("uvt-mem-monitor", move |stop| {
            let mut since_log = Duration::ZERO;
            while stop.sleep(CHECK_INTERVAL) {
                monitor.check();
                since_log += CHECK_INTERVAL;
                if since_log >= LOG_INTERVAL {
                    since_log = Duration::ZERO;
                    let snap = monitor.snapshot();
                    info!(
                        current = %format_bytes(snap.current),
                        peak = %format_bytes(snap.peak),
                        allocated = %format_bytes(snap.total_allocated),
                        freed = %format_bytes(snap.total_freed),
                        "memory usage"
                    );
                }
            }
        })
    }
}

/// Formats a byte count with a binary unit suffix, e.g. `1.50 MB`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tracks_current_and_peak() {
        let monitor = MemoryMonitor::new(u64::MAX);
        monitor.track_allocation(1000);
        monitor.track_allocation(500);
        monitor.track_deallocation(700);

        let snap = monitor.snapshot();
        assert_eq!(snap.current, 800);
        assert_eq!(snap.peak, 1500);
        assert_eq!(snap.total_allocated, 1500);
        assert_eq!(snap.total_freed, 700);
    }

    #[test]
    fn deallocation_saturates_at_zero() {
        let monitor = MemoryMonitor::default();
        monitor.track_deallocation(10);
        assert_eq!(monitor.current_usage(), 0);
    }

    #[test]
    fn alert_fires_once_per_crossing() {
        let monitor = MemoryMonitor::new(1000);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.on_alert(move |alert| {
            assert!(alert.current > alert.threshold);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.track_allocation(600);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        monitor.track_allocation(600);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        monitor.track_allocation(600);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Drop below and cross again.
        monitor.track_deallocation(1500);
        monitor.track_allocation(2000);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
