//! Control-channel framing.
//!
//! Each message is a 4-byte big-endian length prefix followed by a
//! `postcard`-encoded [`ControlMessage`] body. Control messages travel on a
//! TCP connection before it joins a virtual channel; after the handshake the
//! same connection carries channel frames only.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::types::{ClientId, ConnectionId};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest accepted control body.
pub const MAX_CONTROL_BODY: usize = 1024;

/// Why the server refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Client id is not on the allow-list.
    NotAllowed,
    /// Requested connection count differs from the server's.
    CountMismatch,
    /// The peer already holds every connection it is allowed.
    PeerFull,
    /// A non-initial connection arrived for a peer with no admission round.
    UnknownPeer,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotAllowed => "client not allowed",
            Self::CountMismatch => "connection count mismatch",
            Self::PeerFull => "peer already has all connections",
            Self::UnknownPeer => "no admission in progress for peer",
        };
        f.write_str(text)
    }
}

/// Bind request sent by the client on every new TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub client_id: ClientId,
    /// Position of this connection in the channel, `0..count`.
    pub index: u8,
    /// Total connections the client is opening.
    pub count: u8,
}

/// Server acceptance of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindAck {
    pub connection_id: ConnectionId,
    pub index: u8,
}

/// Messages exchanged on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Bind(BindRequest),
    BindAck(BindAck),
    BindReject(RejectReason),
}

/// Errors reading or writing control messages.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("control body encoding failed: {0}")]
    Encode(postcard::Error),
    #[error("control body decoding failed: {0}")]
    Decode(postcard::Error),
    /// Length prefix exceeds [`MAX_CONTROL_BODY`].
    #[error("control body of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Appends `msg` with its length prefix to `out`.
///
/// # Errors
///
/// Returns [`ControlError::Encode`] if serialization fails.
pub fn encode_control(msg: &ControlMessage, out: &mut Vec<u8>) -> Result<(), ControlError> {
    let body = postcard::to_allocvec(msg).map_err(ControlError::Encode)?;
    if body.len() > MAX_CONTROL_BODY {
        return Err(ControlError::TooLarge(body.len()));
    }
    // Bounded by MAX_CONTROL_BODY above.
    let len = body.len() as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Decodes one length-prefixed message from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold the whole message, otherwise
/// the message and the bytes consumed.
///
/// # Errors
///
/// Returns [`ControlError::TooLarge`] for an oversized prefix and
/// [`ControlError::Decode`] for a malformed body.
pub fn decode_control(buf: &[u8]) -> Result<Option<(ControlMessage, usize)>, ControlError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_CONTROL_BODY {
        return Err(ControlError::TooLarge(len));
    }
    let Some(body) = buf.get(LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len) else {
        return Ok(None);
    };
    let msg = postcard::from_bytes(body).map_err(ControlError::Decode)?;
    Ok(Some((msg, LENGTH_PREFIX_LEN + len)))
}

/// Writes one message to a blocking stream.
///
/// # Errors
///
/// Returns an error on encoding or I/O failure.
pub fn write_control<W: Write>(stream: &mut W, msg: &ControlMessage) -> Result<(), ControlError> {
    let mut buf = Vec::with_capacity(32);
    encode_control(msg, &mut buf)?;
    stream.write_all(&buf)?;
    stream.flush()?;
    Ok(())
}

/// Reads exactly one message from a blocking stream.
///
/// Reads only the bytes of that message, so channel frames that follow stay
/// in the socket.
///
/// # Errors
///
/// Returns an error on I/O failure (including read timeouts), an oversized
/// prefix or a malformed body.
pub fn read_control<R: Read>(stream: &mut R) -> Result<ControlMessage, ControlError> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    stream.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_CONTROL_BODY {
        return Err(ControlError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    postcard::from_bytes(&body).map_err(ControlError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bind() -> ControlMessage {
        ControlMessage::Bind(BindRequest {
            client_id: ClientId(0xDEAD_BEEF),
            index: 1,
            count: 2,
        })
    }

    #[test]
    fn prefix_is_big_endian_body_length() {
        let mut buf = Vec::new();
        encode_control(&bind(), &mut buf).unwrap();
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - LENGTH_PREFIX_LEN);
    }

    #[test]
    fn decode_needs_whole_message() {
        let mut buf = Vec::new();
        encode_control(&bind(), &mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(decode_control(&buf[..cut]).unwrap().is_none());
        }
        let (msg, consumed) = decode_control(&buf).unwrap().unwrap();
        assert_eq!(msg, bind());
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn oversized_prefix_rejected() {
        let buf = (MAX_CONTROL_BODY as u32 + 1).to_be_bytes();
        assert!(matches!(
            decode_control(&buf),
            Err(ControlError::TooLarge(n)) if n == MAX_CONTROL_BODY + 1
        ));
        assert!(matches!(
            read_control(&mut Cursor::new(buf.to_vec())),
            Err(ControlError::TooLarge(_))
        ));
    }

    #[test]
    fn stream_read_leaves_following_bytes() {
        let mut wire = Vec::new();
        let ack = ControlMessage::BindAck(BindAck {
            connection_id: ConnectionId(77),
            index: 0,
        });
        write_control(&mut wire, &ack).unwrap();
        wire.extend_from_slice(b"frame bytes");

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_control(&mut cursor).unwrap(), ack);
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"frame bytes");
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut buf = 2u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0xFF, 0xFF]);
        assert!(matches!(decode_control(&buf), Err(ControlError::Decode(_))));
    }

    #[test]
    fn reject_reasons_survive_encoding() {
        for reason in [
            RejectReason::NotAllowed,
            RejectReason::CountMismatch,
            RejectReason::PeerFull,
            RejectReason::UnknownPeer,
        ] {
            let mut buf = Vec::new();
            encode_control(&ControlMessage::BindReject(reason), &mut buf).unwrap();
            let (msg, _) = decode_control(&buf).unwrap().unwrap();
            assert_eq!(msg, ControlMessage::BindReject(reason));
        }
    }
}
