//! Reusable byte buffers for the packet path.

pub mod pool;

pub use pool::{BufferPool, PoolConfig, PoolStats, PooledBuffer, SizeClass};
