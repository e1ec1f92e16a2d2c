//! Throughput counters with a periodic report.
//!
//! Counters are reset by every [`PerformanceMonitor::report`], so each report
//! covers the window since the previous one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::sync::Worker;
use crate::trace::info;

/// Default reporting period.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Rates computed over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceReport {
    pub window: Duration,
    pub packets: u64,
    pub bytes: u64,
    pub packets_per_sec: f64,
    pub megabits_per_sec: f64,
    pub avg_latency: Duration,
}

/// Packet, byte and processing-time counters.
pub struct PerformanceMonitor {
    packets: AtomicU64,
    bytes: AtomicU64,
    processing_micros: AtomicU64,
    window_start: Mutex<Instant>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    /// Records one processed packet of `size` bytes.
    #[inline]
    pub fn record_packet(&self, size: usize, processing: Duration) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.processing_micros.fetch_add(
            u64::try_from(processing.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Packets recorded in the current window.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Bytes recorded in the current window.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Closes the current window and returns its rates.
    pub fn report(&self) -> PerformanceReport {
        let mut start = self
            .window_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let window = now.duration_since(*start);
        *start = now;
        drop(start);

        let packets = self.packets.swap(0, Ordering::Relaxed);
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let micros = self.processing_micros.swap(0, Ordering::Relaxed);

        let secs = window.as_secs_f64();
        let (packets_per_sec, megabits_per_sec) = if secs > 0.0 {
            (
                packets as f64 / secs,
                (bytes * 8) as f64 / (secs * 1_000_000.0),
            )
        } else {
            (0.0, 0.0)
        };
        let avg_latency = if packets > 0 {
            Duration::from_micros(micros / packets)
        } else {
            Duration::ZERO
        };

        PerformanceReport {
            window,
            packets,
            bytes,
            packets_per_sec,
            megabits_per_sec,
            avg_latency,
        }
    }

    /// Starts a thread logging a report every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> std::io::Result<Worker> {
        let monitor = Arc::clone(self);
        Worker::spawn("uvt-perf-report", move |stop| {
            while stop.sleep(interval) {
                let report = monitor.report();
                if report.packets == 0 {
                    continue;
                }
                info!(
                    window_secs = report.window.as_secs_f64(),
                    packets = report.packets,
                    packets_per_sec = report.packets_per_sec,
                    mbps = report.megabits_per_sec,
                    avg_latency_us = report.avg_latency.as_micros() as u64,
                    "performance report"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn report_computes_rates_and_resets() {
        let monitor = PerformanceMonitor::new();
        monitor.record_packet(1000, Duration::from_micros(10));
        monitor.record_packet(3000, Duration::from_micros(30));
        assert_eq!(monitor.packets(), 2);
        assert_eq!(monitor.bytes(), 4000);

        thread::sleep(Duration::from_millis(10));
        let report = monitor.report();
        assert_eq!(report.packets, 2);
        assert_eq!(report.bytes, 4000);
        assert_eq!(report.avg_latency, Duration::from_micros(20));
        assert!(report.window >= Duration::from_millis(10));
        assert!(report.packets_per_sec > 0.0);
        assert!(report.megabits_per_sec > 0.0);

        let empty = monitor.report();
        assert_eq!(empty.packets, 0);
        assert_eq!(empty.avg_latency, Duration::ZERO);
    }

    #[test]
    fn reporter_stops_promptly() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let mut worker = monitor.spawn_reporter(Duration::from_secs(60)).unwrap();
        let start = Instant::now();
        worker.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
