//! Virtual channel frame codec.
//!
//! ## Wire Format
//!
//! All multi-byte integers are big-endian.
//!
//! | Offset | Field       | Size |
//! |--------|-------------|------|
//! | 0      | type        | 1    |
//! | 1      | message id  | 8    |
//! | 9      | data length | 2    |
//! | 11     | payload     | len  |
//!
//! Decoding is stream-oriented: [`decode_frame`] looks at the front of an
//! accumulation buffer and either extracts one frame, asks for more bytes, or
//! reports a fatal condition that ends the connection.

use std::fmt;

use thiserror::Error;

/// Header size in bytes.
pub const FRAME_HEADER_LEN: usize = 11;

/// Maximum payload carried by one frame.
pub const MAX_FRAME_PAYLOAD: usize = 1400;

/// Largest encoded frame.
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD;

/// Frame type byte values.
pub mod frame_type {
    pub const DATA: u8 = 0x00;
}

/// Per-channel message sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u64);

impl MessageId {
    /// First id assigned on a fresh channel.
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Next id (wraps on overflow).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<u64> for MessageId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<MessageId> for u64 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frame kinds understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
}

impl FrameKind {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Data => frame_type::DATA,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            frame_type::DATA => Ok(Self::Data),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Errors encoding or decoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Type byte is not a known frame kind.
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    /// Declared or supplied payload is longer than [`MAX_FRAME_PAYLOAD`].
    #[error("payload length {0} exceeds maximum of 1400")]
    PayloadTooLarge(usize),
}

/// A decoded frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub kind: FrameKind,
    pub message_id: MessageId,
    pub payload: &'a [u8],
}

/// Result of one decode attempt on an accumulation buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decode<'a> {
    /// A whole frame sits at the front of the buffer.
    Complete {
        frame: FrameRef<'a>,
        /// Bytes to drop from the front of the buffer.
        consumed: usize,
    },
    /// The buffer holds a valid prefix; read more and retry.
    NeedMoreData,
    /// The stream is corrupt and cannot be resynchronised.
    Fatal(FrameError),
}

/// Writer for encoding frames into a byte buffer.
struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Appends one DATA frame carrying `payload` to `out`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if `payload` exceeds
/// [`MAX_FRAME_PAYLOAD`]; `out` is left untouched in that case.
pub fn encode_frame(
    message_id: MessageId,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    // Bounded by MAX_FRAME_PAYLOAD above.
    let len = payload.len() as u16;

    out.reserve(FRAME_HEADER_LEN + payload.len());
    let mut w = FrameWriter::new(out);
    w.put_u8(FrameKind::Data.as_u8());
    w.put_u64(message_id.as_u64());
    w.put_u16(len);
    w.put_bytes(payload);
    Ok(())
}

/// Attempts to decode one frame from the front of `buf`.
#[must_use]
pub fn decode_frame(buf: &[u8]) -> Decode<'_> {
    let Some(&type_byte) = buf.first() else {
        return Decode::NeedMoreData;
    };
    let kind = match FrameKind::try_from(type_byte) {
        Ok(kind) => kind,
        Err(e) => return Decode::Fatal(e),
    };
    if buf.len() < FRAME_HEADER_LEN {
        return Decode::NeedMoreData;
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[1..9]);
    let message_id = MessageId(u64::from_be_bytes(id));
    let len = usize::from(u16::from_be_bytes([buf[9], buf[10]]));

    if len > MAX_FRAME_PAYLOAD {
        return Decode::Fatal(FrameError::PayloadTooLarge(len));
    }
    let end = FRAME_HEADER_LEN + len;
    if buf.len() < end {
        return Decode::NeedMoreData;
    }

    Decode::Complete {
        frame: FrameRef {
            kind,
            message_id,
            payload: &buf[FRAME_HEADER_LEN..end],
        },
        consumed: end,
    }
}
