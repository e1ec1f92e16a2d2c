//! Blocking FIFO queue with cooperative cancellation.
//!
//! Every cross-thread handoff in the tunnel goes through a [`BlockingQueue`]:
//! the virtual channel send queue, the per-session delivery queue and the
//! session event queues.
//!
//! # Cancellation
//!
//! [`BlockingQueue::cancel`] wakes every blocked consumer. From that point on
//! every `dequeue` returns `None`, even if items are still queued. Leftover
//! items can be reclaimed with [`BlockingQueue::drain`].
//!
//! # Example
//!
//! ```
//! use uvtunnel::sync::BlockingQueue;
//!
//! let queue = BlockingQueue::new();
//! queue.enqueue(7u32).unwrap();
//! assert_eq!(queue.dequeue(), Some(7));
//!
//! queue.cancel();
//! assert_eq!(queue.dequeue(), None);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

/// Wait bound for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Outcome of a bounded-wait dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    /// An item was available.
    Item(T),
    /// The wait expired with the queue still empty.
    TimedOut,
    /// The queue was cancelled.
    Cancelled,
}

impl<T> Dequeued<T> {
    /// Returns the item, discarding the reason when there is none.
    #[must_use]
    pub fn item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::TimedOut | Self::Cancelled => None,
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    cancelled: bool,
}

/// Thread-safe FIFO with blocking dequeue and broadcast cancellation.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Creates an empty, live queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                cancelled: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item and wakes one waiting consumer.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been cancelled.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available or the queue is cancelled.
    ///
    /// Returns `None` once cancelled, regardless of queued items.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_timeout(Timeout::Infinite).item()
    }

    /// Blocks for at most `timeout` waiting for an item.
    pub fn dequeue_timeout(&self, timeout: impl Into<Timeout>) -> Dequeued<T> {
        let deadline = match timeout.into() {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };

        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Dequeued::Cancelled;
            }
            if let Some(item) = state.items.pop_front() {
                return Dequeued::Item(item);
            }
            match deadline {
                None => {
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Dequeued::TimedOut;
                    }
                    state = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Pops an item without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        if state.cancelled {
            return None;
        }
        state.items.pop_front()
    }

    /// Cancels the queue and wakes every waiter, present and future.
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.available.notify_all();
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Removes and returns every queued item, cancelled or not.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

/// Point-in-time view of an [`InstrumentedQueue`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted over the queue's lifetime.
    pub enqueued: u64,
    /// Items handed to consumers over the queue's lifetime.
    pub dequeued: u64,
    /// Highest queue depth observed.
    pub peak_depth: u64,
    /// Mean time an item spent queued before being dequeued.
    pub average_wait: Duration,
}

struct Stamped<T> {
    item: T,
    queued_at: Instant,
}

/// [`BlockingQueue`] that keeps throughput and latency counters.
///
/// Same blocking and cancellation contract as the plain queue.
pub struct InstrumentedQueue<T> {
    inner: BlockingQueue<Stamped<T>>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    peak_depth: AtomicU64,
    total_wait_nanos: AtomicU64,
}

impl<T> Default for InstrumentedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InstrumentedQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: BlockingQueue::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            peak_depth: AtomicU64::new(0),
            total_wait_nanos: AtomicU64::new(0),
        }
    }

    /// See [`BlockingQueue::enqueue`].
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been cancelled.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let stamped = Stamped {
            item,
            queued_at: Instant::now(),
        };
        self.inner.enqueue(stamped).map_err(|s| s.item)?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak_depth
            .fetch_max(self.inner.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// See [`BlockingQueue::dequeue`].
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_timeout(Timeout::Infinite).item()
    }

    /// See [`BlockingQueue::dequeue_timeout`].
    pub fn dequeue_timeout(&self, timeout: impl Into<Timeout>) -> Dequeued<T> {
        match self.inner.dequeue_timeout(timeout) {
            Dequeued::Item(stamped) => Dequeued::Item(self.record(stamped)),
            Dequeued::TimedOut => Dequeued::TimedOut,
            Dequeued::Cancelled => Dequeued::Cancelled,
        }
    }

    /// See [`BlockingQueue::try_dequeue`].
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.try_dequeue().map(|s| self.record(s))
    }

    fn record(&self, stamped: Stamped<T>) -> T {
        let waited = stamped.queued_at.elapsed();
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.total_wait_nanos.fetch_add(
            u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        stamped.item
    }

    /// See [`BlockingQueue::cancel`].
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// See [`BlockingQueue::drain`]. Drained items do not count as dequeued.
    pub fn drain(&self) -> Vec<T> {
        self.inner.drain().into_iter().map(|s| s.item).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let dequeued = self.dequeued.load(Ordering::Relaxed);
        let total_wait = self.total_wait_nanos.load(Ordering::Relaxed);
        let average_wait = if dequeued == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_wait / dequeued)
        };
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued,
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            average_wait,
        }
    }
}
