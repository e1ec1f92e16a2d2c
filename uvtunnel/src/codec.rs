//! Wire codecs.
//!
//! - `frame`: virtual channel frames (`type | message id | length | payload`).
//! - `uvt`: coalesced UDP datagram sub-frames (`size | id | checksum | payload`).
//! - `control`: length-prefixed handshake messages.

pub mod control;
pub mod frame;
pub mod uvt;

pub use frame::{
    Decode, FRAME_HEADER_LEN, FrameError, FrameKind, FrameRef, MAX_FRAME_LEN, MAX_FRAME_PAYLOAD,
    MessageId, decode_frame, encode_frame,
};
pub use uvt::{UVT_HEADER_LEN, UvtDatagram, UvtError, UvtFrames, UvtStream, encode_datagram};
