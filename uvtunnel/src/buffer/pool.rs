//! Tiered pool of reusable byte buffers.
//!
//! # Problem
//! Every UDP datagram and every channel frame needs a scratch buffer. Allocating
//! and freeing one per packet churns the allocator on the hot path.
//!
//! # Solution
//! Three independent free-lists (small, medium, large), each behind its own
//! lock so unrelated sizes never contend. Buffers are handed out as
//! [`PooledBuffer`], a move-only handle: dropping it returns the storage to its
//! tier, [`PooledBuffer::into_vec`] detaches it for good. A buffer therefore has
//! exactly one owner at a time and is either recycled or consumed, never both.
//!
//! # Trimming
//! Each tier remembers the largest free-list length seen since the last trim.
//! [`BufferPool::trim`] shrinks the free-list to a fraction of that peak, so
//! memory held after a burst decays over a few trim periods.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::monitor::MemoryMonitor;
use crate::sync::Worker;
use crate::trace::{debug, trace};

/// Pool sizing and trimming parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Capacity of small-tier buffers.
    pub small_size: usize,
    /// Capacity of medium-tier buffers.
    pub medium_size: usize,
    /// Capacity of large-tier buffers. Larger requests are never pooled.
    pub large_size: usize,
    /// Maximum idle buffers kept per tier.
    pub max_per_tier: usize,
    /// Period of the background trim thread.
    pub trim_interval: Duration,
    /// Fraction of each tier's observed peak kept by a trim, in `(0, 1]`.
    pub keep_fraction: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_size: 1024,
            medium_size: 16 * 1024,
            large_size: 64 * 1024,
            max_per_tier: 100,
            trim_interval: Duration::from_secs(30),
            keep_fraction: 0.7,
        }
    }
}

/// Size class a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    /// Above the large tier; allocated on demand and freed on drop.
    Oversized,
}

impl SizeClass {
    const fn index(self) -> Option<usize> {
        match self {
            Self::Small => Some(0),
            Self::Medium => Some(1),
            Self::Large => Some(2),
            Self::Oversized => None,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Oversized => "oversized",
        };
        f.write_str(name)
    }
}

/// Counters exposed by [`BufferPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes of capacity allocated over the pool's lifetime.
    pub bytes_allocated: u64,
    /// Buffers created because no idle one was available.
    pub created: u64,
    /// Checkouts served from a free-list.
    pub reused: u64,
    /// Buffers returned to a free-list.
    pub recycled: u64,
    /// Idle buffers per tier (small, medium, large).
    pub available: [usize; 3],
}

struct TierState {
    free: Vec<Vec<u8>>,
    peak: usize,
}

struct Tier {
    class: SizeClass,
    capacity: usize,
    state: Mutex<TierState>,
}

impl Tier {
    fn new(class: SizeClass, capacity: usize) -> Self {
        Self {
            class,
            capacity,
            state: Mutex::new(TierState {
                free: Vec::new(),
                peak: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolInner {
    config: PoolConfig,
    tiers: [Tier; 3],
    monitor: Option<Arc<MemoryMonitor>>,
    bytes_allocated: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
}

impl PoolInner {
    fn class_for(&self, len: usize) -> SizeClass {
        self.tiers
            .iter()
            .find(|tier| len <= tier.capacity)
            .map_or(SizeClass::Oversized, |tier| tier.class)
    }

    fn allocate(&self, capacity: usize) -> Vec<u8> {
        let data = Vec::with_capacity(capacity);
        self.created.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(data.capacity() as u64, Ordering::Relaxed);
        if let Some(monitor) = &self.monitor {
            monitor.track_allocation(data.capacity());
        }
        data
    }

    /// Frees storage that was accounted as `accounted` bytes.
    fn release(&self, data: Vec<u8>, accounted: usize) {
        if let Some(monitor) = &self.monitor {
            monitor.track_deallocation(accounted);
        }
        drop(data);
    }

    fn give_back(&self, mut data: Vec<u8>, class: SizeClass, accounted: usize) {
        let Some(idx) = class.index() else {
            self.release(data, accounted);
            return;
        };
        let tier = &self.tiers[idx];
        // Storage that grew after checkout was reallocated behind the pool's back.
        if data.capacity() != accounted {
            self.release(data, accounted);
            return;
        }
        data.clear();
        let mut state = tier.lock();
        if state.free.len() >= self.config.max_per_tier {
            drop(state);
            self.release(data, accounted);
            return;
        }
        state.free.push(data);
        state.peak = state.peak.max(state.free.len());
        drop(state);
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared handle to a tiered buffer pool.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl BufferPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a pool that reports allocations to `monitor`.
    #[must_use]
    pub fn with_monitor(config: PoolConfig, monitor: Arc<MemoryMonitor>) -> Self {
        Self::build(config, Some(monitor))
    }

    fn build(config: PoolConfig, monitor: Option<Arc<MemoryMonitor>>) -> Self {
        let tiers = [
            Tier::new(SizeClass::Small, config.small_size),
            Tier::new(SizeClass::Medium, config.medium_size),
            Tier::new(SizeClass::Large, config.large_size),
        ];
        Self {
            inner: Arc::new(PoolInner {
                config,
                tiers,
                monitor,
                bytes_allocated: AtomicU64::new(0),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Size class that would serve a request of `len` bytes.
    #[must_use]
    pub fn class_for(&self, len: usize) -> SizeClass {
        self.inner.class_for(len)
    }

    /// Checks out a zero-filled buffer of exactly `len` bytes.
    #[must_use]
    pub fn checkout(&self, len: usize) -> PooledBuffer {
        let mut buf = self.checkout_empty(len);
        buf.data.resize(len, 0);
        buf
    }

    /// Checks out an empty buffer with room for at least `capacity` bytes.
    #[must_use]
    pub fn checkout_empty(&self, capacity: usize) -> PooledBuffer {
        let class = self.inner.class_for(capacity);
        let data = match class.index() {
            Some(idx) => {
                let tier = &self.inner.tiers[idx];
                let reused = tier.lock().free.pop();
                match reused {
                    Some(data) => {
                        self.inner.reused.fetch_add(1, Ordering::Relaxed);
                        data
                    }
                    None => self.inner.allocate(tier.capacity),
                }
            }
            None => self.inner.allocate(capacity),
        };
        let accounted = data.capacity();
        PooledBuffer {
            data,
            class,
            accounted,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Copies `bytes` into a freshly checked-out buffer.
    #[must_use]
    pub fn copy_from(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buf = self.checkout_empty(bytes.len());
        buf.data.extend_from_slice(bytes);
        buf
    }

    /// Shrinks every tier toward `keep_fraction` of its peak since the last trim.
    ///
    /// Returns the number of buffers released.
    pub fn trim(&self) -> usize {
        let keep = self.inner.config.keep_fraction.clamp(0.0, 1.0);
        let mut released = 0;
        for tier in &self.inner.tiers {
            let mut state = tier.lock();
            let target = (state.peak as f64 * keep).floor() as usize;
            let excess: Vec<Vec<u8>> = if state.free.len() > target {
                state.free.drain(target..).collect()
            } else {
                Vec::new()
            };
            state.peak = state.free.len();
            drop(state);

            if !excess.is_empty() {
                trace!(tier = %tier.class, released = excess.len(), "trimmed tier");
            }
            released += excess.len();
            for data in excess {
                let accounted = data.capacity();
                self.inner.release(data, accounted);
            }
        }
        released
    }

    /// Starts the background trim thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_trimmer(&self) -> std::io::Result<Worker> {
        let pool = self.clone();
        let interval = self.inner.config.trim_interval;
        Worker::spawn("uvt-pool-trim", move |stop| {
            while stop.sleep(interval) {
                let released = pool.trim();
                if released > 0 {
                    debug!(released, "buffer pool trimmed");
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let mut available = [0; 3];
        for (slot, tier) in available.iter_mut().zip(&inner.tiers) {
            *slot = tier.lock().free.len();
        }
        PoolStats {
            bytes_allocated: inner.bytes_allocated.load(Ordering::Relaxed),
            created: inner.created.load(Ordering::Relaxed),
            reused: inner.reused.load(Ordering::Relaxed),
            recycled: inner.recycled.load(Ordering::Relaxed),
            available,
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Byte buffer checked out of a [`BufferPool`].
///
/// Dereferences to its filled bytes. Dropping the handle recycles the storage;
/// if the pool is gone by then the storage is simply freed.
pub struct PooledBuffer {
    data: Vec<u8>,
    class: SizeClass,
    /// Bytes reported to the memory monitor for this storage.
    accounted: usize,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Wraps an owned vector that does not belong to any pool.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn detached(data: Vec<u8>) -> Self {
        Self {
            data,
            class: SizeClass::Oversized,
            accounted: 0,
            pool: Weak::new(),
        }
    }

    #[must_use]
    pub const fn size_class(&self) -> SizeClass {
        self.class
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Mutable access to the underlying vector, for writers that build into it.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Consumes the handle and takes the bytes out of pool accounting.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            if let Some(monitor) = &pool.monitor {
                monitor.track_deallocation(self.accounted);
            }
        }
        self.pool = Weak::new();
        data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(std::mem::take(&mut self.data), self.class, self.accounted);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("class", &self.class)
            .finish()
    }
}
