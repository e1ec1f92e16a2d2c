//! Advisory telemetry: memory accounting and throughput reporting.

pub mod memory;
pub mod performance;

pub use memory::{MemoryAlert, MemoryMonitor, MemorySnapshot, format_bytes};
pub use performance::{PerformanceMonitor, PerformanceReport};
