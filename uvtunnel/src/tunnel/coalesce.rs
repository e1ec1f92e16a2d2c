//! UDP datagram coalescing.
//!
//! # Problem
//! Small datagrams each become at least one channel frame and one TCP write.
//!
//! # Solution
//! Frame every datagram with the UVT sub-frame header and hold it back until
//! a batch is worth sending. A batch is released together with the datagram
//! that triggers it, when either:
//! - buffered plus incoming bytes exceed the batch limit, or
//! - more than the flush interval has passed since the previous release.
//!
//! The reader also calls [`Coalescer::flush_expired`] whenever its socket
//! wait times out, so a trailing datagram does not sit in the buffer until
//! the next one arrives.

use std::time::Duration;

use minstant::Instant;

use crate::codec::uvt::{MAX_UVT_PAYLOAD, UvtError, encode_datagram, framed_len};
use crate::config::CoalesceOptions;

/// Batches UVT-framed datagrams.
pub struct Coalescer {
    enabled: bool,
    batch_limit: usize,
    flush_interval: Duration,
    buffer: Vec<u8>,
    buffered: usize,
    next_id: u8,
    last_flush: Instant,
}

impl Coalescer {
    #[must_use]
    pub fn new(options: &CoalesceOptions) -> Self {
        Self {
            enabled: options.enabled,
            batch_limit: options.batch_limit,
            flush_interval: options.flush_interval(),
            buffer: Vec::with_capacity(options.batch_limit),
            buffered: 0,
            next_id: 0,
            last_flush: Instant::now(),
        }
    }

    /// Bytes currently held back.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Datagrams currently held back.
    #[inline]
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.buffered
    }

    fn take_id(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Frames `datagram` and either buffers it or releases a batch ending
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`UvtError::PayloadTooLarge`] for a datagram longer than a
    /// sub-frame can describe; the buffer is left as it was.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, UvtError> {
        if datagram.len() > MAX_UVT_PAYLOAD {
            return Err(UvtError::PayloadTooLarge(datagram.len()));
        }
        let id = self.take_id();

        if !self.enabled {
            let mut out = Vec::with_capacity(framed_len(datagram.len()));
            encode_datagram(id, datagram, &mut out)?;
            return Ok(Some(out));
        }

        let over_limit = self.buffer.len() + framed_len(datagram.len()) > self.batch_limit;
        let interval_passed = self.last_flush.elapsed() > self.flush_interval;
        if over_limit || interval_passed {
            let mut batch = self.release();
            encode_datagram(id, datagram, &mut batch)?;
            return Ok(Some(batch));
        }

        encode_datagram(id, datagram, &mut self.buffer)?;
        self.buffered += 1;
        Ok(None)
    }

    /// Releases the buffer if it is non-empty and the flush interval has
    /// passed.
    pub fn flush_expired(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() || self.last_flush.elapsed() <= self.flush_interval {
            return None;
        }
        Some(self.release())
    }

    /// Releases whatever is buffered.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.release())
    }

    fn release(&mut self) -> Vec<u8> {
        self.last_flush = Instant::now();
        self.buffered = 0;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::uvt::decode_batch;

    fn options(enabled: bool, flush_ms: u64) -> CoalesceOptions {
        CoalesceOptions {
            enabled,
            batch_limit: 1400,
            flush_interval_ms: flush_ms,
        }
    }

    fn payloads(batch: &[u8]) -> Vec<Vec<u8>> {
        let (datagrams, rest) = decode_batch(batch).unwrap();
        assert!(rest.is_empty());
        datagrams.iter().map(|d| d.payload.to_vec()).collect()
    }

    #[test]
    fn small_datagrams_wait_for_batch() {
        let mut c = Coalescer::new(&options(true, 60_000));
        assert!(c.push(&[1; 100]).unwrap().is_none());
        assert!(c.push(&[2; 50]).unwrap().is_none());
        assert_eq!(c.buffered(), 2);
        assert_eq!(c.len(), 100 + 50 + 8);

        let batch = c.push(&[3; 2000]).unwrap().unwrap();
        assert_eq!(payloads(&batch), vec![vec![1; 100], vec![2; 50], vec![3; 2000]]);
        assert!(c.is_empty());
    }

    #[test]
    fn limit_counts_headers() {
        let mut c = Coalescer::new(&options(true, 60_000));
        // 700 + 4 twice is 1408, over the limit.
        assert!(c.push(&[0; 700]).unwrap().is_none());
        let batch = c.push(&[1; 700]).unwrap().unwrap();
        assert_eq!(payloads(&batch).len(), 2);
    }

    #[test]
    fn interval_releases_on_next_push() {
        let mut c = Coalescer::new(&options(true, 10));
        assert!(c.push(b"a").unwrap().is_none());
        std::thread::sleep(Duration::from_millis(20));
        let batch = c.push(b"b").unwrap().unwrap();
        assert_eq!(payloads(&batch), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn idle_flush_after_interval() {
        let mut c = Coalescer::new(&options(true, 10));
        assert!(c.flush_expired().is_none());
        // Interval restarts on release, so this push is buffered.
        c.take();
        assert!(c.push(b"tail").unwrap().is_none());
        assert!(c.flush_expired().is_none());
        std::thread::sleep(Duration::from_millis(20));
        let batch = c.flush_expired().unwrap();
        assert_eq!(payloads(&batch), vec![b"tail".to_vec()]);
        assert!(c.flush_expired().is_none());
    }

    #[test]
    fn disabled_sends_each_datagram() {
        let mut c = Coalescer::new(&options(false, 60_000));
        let first = c.push(b"one").unwrap().unwrap();
        let second = c.push(b"two").unwrap().unwrap();
        assert_eq!(payloads(&first), vec![b"one".to_vec()]);
        assert_eq!(payloads(&second), vec![b"two".to_vec()]);
        assert!(c.take().is_none());
    }

    #[test]
    fn ids_roll_over() {
        let mut c = Coalescer::new(&options(false, 0));
        let mut last = Vec::new();
        for _ in 0..=256 {
            last = c.push(b"x").unwrap().unwrap();
        }
        let (datagrams, _) = decode_batch(&last).unwrap();
        assert_eq!(datagrams[0].id, 0);
    }

    #[test]
    fn oversized_datagram_rejected_without_losing_buffer() {
        let mut c = Coalescer::new(&options(true, 60_000));
        c.push(b"keep").unwrap();
        let big = vec![0u8; MAX_UVT_PAYLOAD + 1];
        assert!(matches!(c.push(&big), Err(UvtError::PayloadTooLarge(_))));
        assert_eq!(c.buffered(), 1);
    }
}
