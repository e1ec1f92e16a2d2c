//! UVT sub-frame codec for coalesced UDP datagrams.
//!
//! # Problem
//! Writing every small UDP datagram to TCP on its own costs one syscall and
//! one channel frame per datagram.
//!
//! # Solution
//! Datagrams are wrapped in a 4-byte header and concatenated into batches.
//! The receive side walks a batch header by header to recover each datagram.
//!
//! ## Wire Format
//!
//! | Offset | Field    | Size |
//! |--------|----------|------|
//! | 0      | size     | 2 (big-endian) |
//! | 2      | id       | 1 (rolling)    |
//! | 3      | checksum | 1 (XOR of payload) |
//! | 4      | payload  | size |
//!
//! # Design
//! - [`encode_datagram`]: append one framed datagram
//! - [`UvtFrames`]: iterate over the complete datagrams at the front of a buffer
//! - [`UvtStream`]: accumulator for batches that arrive split across deliveries

use thiserror::Error;

/// Sub-frame header size in bytes.
pub const UVT_HEADER_LEN: usize = 4;

/// Largest payload a sub-frame can describe.
pub const MAX_UVT_PAYLOAD: usize = u16::MAX as usize;

/// Errors raised by the UVT codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UvtError {
    /// Payload does not fit the 16-bit size field.
    #[error("datagram of {0} bytes exceeds the 65535-byte sub-frame limit")]
    PayloadTooLarge(usize),
    /// Checksum of a complete sub-frame does not match its payload.
    #[error("checksum mismatch on datagram {id}: expected {expected:#04x}, computed {actual:#04x}")]
    Checksum { id: u8, expected: u8, actual: u8 },
}

/// Decoded sub-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvtHeader {
    pub size: u16,
    pub id: u8,
    pub checksum: u8,
}

impl UvtHeader {
    /// Parses a header from the first [`UVT_HEADER_LEN`] bytes of `buf`.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let header = buf.get(..UVT_HEADER_LEN)?;
        Some(Self {
            size: u16::from_be_bytes([header[0], header[1]]),
            id: header[2],
            checksum: header[3],
        })
    }

    /// Total encoded length of the sub-frame this header describes.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        UVT_HEADER_LEN + self.size as usize
    }
}

/// XOR of every payload byte.
#[inline]
#[must_use]
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Encoded length of a datagram of `payload_len` bytes.
#[inline]
#[must_use]
pub const fn framed_len(payload_len: usize) -> usize {
    UVT_HEADER_LEN + payload_len
}

/// Appends `payload` framed with `id` to `out`.
///
/// # Errors
///
/// Returns [`UvtError::PayloadTooLarge`] if the payload does not fit the size
/// field; `out` is left untouched.
pub fn encode_datagram(id: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<(), UvtError> {
    let size =
        u16::try_from(payload.len()).map_err(|_| UvtError::PayloadTooLarge(payload.len()))?;
    out.reserve(framed_len(payload.len()));
    out.extend_from_slice(&size.to_be_bytes());
    out.push(id);
    out.push(checksum(payload));
    out.extend_from_slice(payload);
    Ok(())
}

/// One datagram recovered from a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvtDatagram<'a> {
    pub id: u8,
    pub payload: &'a [u8],
}

/// Iterator over the complete sub-frames at the front of a buffer.
///
/// Stops at the first incomplete header or payload; [`remainder`](Self::remainder)
/// then returns that tail untouched. A checksum mismatch yields one `Err` and
/// ends the iteration.
///
/// # Usage
/// ```
/// use uvtunnel::codec::uvt::{UvtFrames, encode_datagram};
///
/// let mut batch = Vec::new();
/// encode_datagram(1, b"ping", &mut batch).unwrap();
/// encode_datagram(2, b"pong", &mut batch).unwrap();
///
/// let mut frames = UvtFrames::new(&batch);
/// let payloads: Vec<_> = frames.by_ref().map(|d| d.unwrap().payload).collect();
/// assert_eq!(payloads, vec![&b"ping"[..], &b"pong"[..]]);
/// assert!(frames.remainder().is_empty());
/// ```
pub struct UvtFrames<'a> {
    data: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> UvtFrames<'a> {
    #[inline]
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            failed: false,
        }
    }

    /// Bytes not yet consumed by the iterator.
    #[inline]
    #[must_use]
    pub fn remainder(&self) -> &'a [u8] {
        &self.data[self.cursor..]
    }

    /// Number of bytes consumed so far.
    #[inline]
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.cursor
    }
}

impl<'a> Iterator for UvtFrames<'a> {
    type Item = Result<UvtDatagram<'a>, UvtError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = self.remainder();
        let header = UvtHeader::parse(rest)?;
        if rest.len() < header.frame_len() {
            return None;
        }

        let payload = &rest[UVT_HEADER_LEN..header.frame_len()];
        let actual = checksum(payload);
        if actual != header.checksum {
            self.failed = true;
            return Some(Err(UvtError::Checksum {
                id: header.id,
                expected: header.checksum,
                actual,
            }));
        }

        self.cursor += header.frame_len();
        Some(Ok(UvtDatagram {
            id: header.id,
            payload,
        }))
    }
}

/// Decodes every complete datagram in `buf`.
///
/// Returns the datagrams and the unconsumed tail. When the first sub-frame is
/// incomplete, no datagrams are returned and the tail is `buf` itself.
///
/// # Errors
///
/// Returns [`UvtError::Checksum`] on the first corrupt sub-frame.
pub fn decode_batch(buf: &[u8]) -> Result<(Vec<UvtDatagram<'_>>, &[u8]), UvtError> {
    let mut frames = UvtFrames::new(buf);
    let datagrams = frames.by_ref().collect::<Result<Vec<_>, _>>()?;
    Ok((datagrams, frames.remainder()))
}

/// Reassembles sub-frames from batches delivered in arbitrary slices.
///
/// Channel payloads are appended with [`push`](Self::push); complete datagrams
/// are handed out by [`drain`](Self::drain) and partial tails wait for the
/// next delivery.
#[derive(Debug, Default)]
pub struct UvtStream {
    pending: Vec<u8>,
}

impl UvtStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Calls `emit` for every complete datagram and drops them from the buffer.
    ///
    /// Returns the number of datagrams emitted.
    ///
    /// # Errors
    ///
    /// On a checksum mismatch the buffered bytes are discarded, since the
    /// stream can no longer be trusted, and the error is returned.
    pub fn drain<F>(&mut self, mut emit: F) -> Result<usize, UvtError>
    where
        F: FnMut(UvtDatagram<'_>),
    {
        let mut frames = UvtFrames::new(&self.pending);
        let mut count = 0;
        let mut failure = None;
        for item in frames.by_ref() {
            match item {
                Ok(datagram) => {
                    emit(datagram);
                    count += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let consumed = frames.consumed();

        if let Some(e) = failure {
            self.pending.clear();
            return Err(e);
        }
        self.pending.drain(..consumed);
        Ok(count)
    }

    /// Bytes waiting for the rest of their sub-frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_datagram(id, payload, &mut out).unwrap();
        out
    }

    #[test]
    fn header_layout() {
        let buf = framed(9, &[0x0F, 0xF0, 0x01]);
        assert_eq!(&buf[..2], &[0, 3]);
        assert_eq!(buf[2], 9);
        assert_eq!(buf[3], 0x0F ^ 0xF0 ^ 0x01);
        assert_eq!(&buf[4..], &[0x0F, 0xF0, 0x01]);
    }

    #[test]
    fn single_datagram_decodes_with_empty_remainder() {
        let payload: Vec<u8> = (0..=255).collect();
        let buf = framed(200, &payload);
        let (datagrams, rest) = decode_batch(&buf).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].id, 200);
        assert_eq!(datagrams[0].payload, &payload[..]);
        assert!(rest.is_empty());
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let buf = framed(3, b"integrity");
        for byte in UVT_HEADER_LEN..buf.len() {
            for bit in 0..8 {
                let mut corrupt = buf.clone();
                corrupt[byte] ^= 1 << bit;
                assert!(
                    matches!(decode_batch(&corrupt), Err(UvtError::Checksum { id: 3, .. })),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn truncated_frame_returns_input_unchanged() {
        let buf = framed(1, &[7u8; 50]);
        for cut in 0..buf.len() {
            let partial = &buf[..cut];
            let (datagrams, rest) = decode_batch(partial).unwrap();
            assert!(datagrams.is_empty());
            assert_eq!(rest, partial);
            assert_eq!(rest.as_ptr(), partial.as_ptr());
        }
    }

    #[test]
    fn batch_with_partial_tail() {
        let mut batch = framed(1, b"one");
        batch.extend(framed(2, b"two"));
        let tail = framed(3, b"three");
        batch.extend_from_slice(&tail[..5]);

        let (datagrams, rest) = decode_batch(&batch).unwrap();
        let ids: Vec<_> = datagrams.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(rest, &tail[..5]);
    }

    #[test]
    fn empty_payload_datagram() {
        let buf = framed(0, b"");
        assert_eq!(buf, vec![0, 0, 0, 0]);
        let (datagrams, rest) = decode_batch(&buf).unwrap();
        assert_eq!(datagrams, vec![UvtDatagram { id: 0, payload: b"" }]);
        assert!(rest.is_empty());
    }

    #[test]
    fn payload_over_u16_rejected() {
        let mut out = Vec::new();
        let big = vec![0u8; MAX_UVT_PAYLOAD + 1];
        assert_eq!(
            encode_datagram(0, &big, &mut out),
            Err(UvtError::PayloadTooLarge(MAX_UVT_PAYLOAD + 1))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn stream_reassembles_across_arbitrary_splits() {
        let sizes = [100usize, 50, 2000, 1, 0, 1400];
        let mut batch = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            encode_datagram(i as u8, &vec![i as u8; size], &mut batch).unwrap();
        }

        for chunk in [1usize, 3, 7, 1400, batch.len()] {
            let mut stream = UvtStream::new();
            let mut got = Vec::new();
            for piece in batch.chunks(chunk) {
                stream.push(piece);
                stream
                    .drain(|d| got.push((d.id, d.payload.len())))
                    .unwrap();
            }
            let expected: Vec<_> = sizes.iter().enumerate().map(|(i, &s)| (i as u8, s)).collect();
            assert_eq!(got, expected, "chunk size {chunk}");
            assert_eq!(stream.pending_len(), 0);
        }
    }

    #[test]
    fn stream_discards_after_corruption() {
        let mut batch = framed(1, b"good");
        let mut bad = framed(2, b"bad");
        bad[5] ^= 0xFF;
        batch.extend(bad);

        let mut stream = UvtStream::new();
        stream.push(&batch);
        let mut seen = Vec::new();
        let err = stream.drain(|d| seen.push(d.id)).unwrap_err();
        assert!(matches!(err, UvtError::Checksum { id: 2, .. }));
        assert_eq!(seen, vec![1]);
        assert_eq!(stream.pending_len(), 0);
    }
}
