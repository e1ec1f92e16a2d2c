//! Reorder buffer for virtual channel arrivals.
//!
//! Frames of one channel travel over several TCP connections and arrive
//! interleaved. The `ReorderBuffer` keeps frames that arrived ahead of their
//! predecessor and yields them strictly in message-id order.
//!
//! # Design
//!
//! - Ordered map keyed by message id; entries exist only while waiting
//! - Tracks `next_expected` (next id to deliver to the owner)
//! - Ids below `next_expected` were already delivered and are dropped
//!
//! # Example
//!
//! ```ignore
//! let mut reorder = ReorderBuffer::new();
//!
//! match reorder.insert(id, payload) {
//!     InsertResult::Accepted => { /* buffered */ }
//!     InsertResult::Duplicate => { /* already buffered */ }
//!     InsertResult::TooOld => { /* already delivered */ }
//! }
//!
//! reorder.drain_ready(|id, payload| deliver(id, payload));
//! ```

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::codec::MessageId;

/// Result of inserting a frame into the reorder buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Frame was accepted and buffered.
    Accepted,
    /// A frame with this id is already buffered.
    Duplicate,
    /// The id was already delivered.
    TooOld,
}

/// Reorder buffer keyed by message id.
///
/// # Invariants
///
/// - `next_expected` never decreases
/// - every buffered id is `>= next_expected`
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, T>,
    next_expected: u64,
}

impl<T> ReorderBuffer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_expected: MessageId::ZERO.as_u64(),
        }
    }

    /// Returns the next id to deliver.
    #[inline]
    #[must_use]
    pub fn next_expected(&self) -> MessageId {
        MessageId(self.next_expected)
    }

    /// Number of buffered frames.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Inserts a frame.
    pub fn insert(&mut self, id: MessageId, frame: T) -> InsertResult {
        let raw = id.as_u64();
        if raw < self.next_expected {
            return InsertResult::TooOld;
        }
        match self.pending.entry(raw) {
            Entry::Occupied(_) => InsertResult::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(frame);
                InsertResult::Accepted
            }
        }
    }

    /// Pops the frame for `next_expected` if it is buffered.
    pub fn pop_ready(&mut self) -> Option<(MessageId, T)> {
        let frame = self.pending.remove(&self.next_expected)?;
        let id = MessageId(self.next_expected);
        self.next_expected = self.next_expected.wrapping_add(1);
        Some((id, frame))
    }

    /// Calls `f(id, frame)` for each contiguous ready frame, in order.
    ///
    /// Returns the number of frames delivered.
    pub fn drain_ready<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(MessageId, T),
    {
        let mut delivered = 0;
        while let Some((id, frame)) = self.pop_ready() {
            f(id, frame);
            delivered += 1;
        }
        delivered
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
