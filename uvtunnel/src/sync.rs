//! Synchronization primitives for in-process communication.
//!
//! - [`BlockingQueue`] / [`InstrumentedQueue`]: cancellable FIFO handoff between threads.
//! - [`Worker`] / [`StopSignal`]: named threads with cooperative stop.

pub mod queue;
pub mod worker;

pub use queue::{BlockingQueue, Dequeued, InstrumentedQueue, QueueStats, Timeout};
pub use worker::{StopSignal, Worker};
