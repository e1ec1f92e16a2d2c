//! Bind handshake run on each TCP connection before it joins a channel.
//!
//! ```text
//! Client                                   Server
//!   │  Bind(client_id, index, count)         │
//!   │───────────────────────────────────────>│
//!   │                   [allow-list, count,  │
//!   │                    peer admission]     │
//!   │  BindAck(connection_id, index)         │
//!   │<───────────────────────────────────────│
//!   │            or                          │
//!   │  BindReject(reason), then close        │
//!   │<───────────────────────────────────────│
//! ```

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::codec::control::{
    BindAck, BindRequest, ControlMessage, RejectReason, read_control, write_control,
};
use crate::control::types::{AllowList, HandshakeError};

/// Reader that fails once `deadline` has passed, however the bytes trickle in.
struct DeadlineReader<'a> {
    stream: &'a mut TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

/// Reads one control message that must arrive in full within `timeout`.
fn read_within(stream: &mut TcpStream, timeout: Duration) -> Result<ControlMessage, HandshakeError> {
    let mut reader = DeadlineReader {
        stream: &mut *stream,
        deadline: Instant::now() + timeout,
    };
    let result = read_control(&mut reader).map_err(HandshakeError::from_control);
    stream
        .set_read_timeout(None)
        .map_err(HandshakeError::Socket)?;
    result
}

/// Client side: send Bind and wait for the server's verdict.
///
/// # Errors
///
/// - [`HandshakeError::Rejected`] if the server answered with BindReject
/// - [`HandshakeError::Timeout`] if no reply arrived within `timeout`
/// - [`HandshakeError::ProtocolViolation`] on an unexpected reply
pub fn client_bind(
    stream: &mut TcpStream,
    request: BindRequest,
    timeout: Duration,
) -> Result<BindAck, HandshakeError> {
    write_control(stream, &ControlMessage::Bind(request)).map_err(HandshakeError::from_control)?;

    let reply = read_within(stream, timeout)?;

    match reply {
        ControlMessage::BindAck(ack) if ack.index == request.index => Ok(ack),
        ControlMessage::BindAck(_) => Err(HandshakeError::ProtocolViolation(
            "ack names another connection index",
        )),
        ControlMessage::BindReject(reason) => Err(HandshakeError::Rejected(reason)),
        ControlMessage::Bind(_) => Err(HandshakeError::ProtocolViolation(
            "server sent a bind request",
        )),
    }
}

/// Server side: wait for the client's Bind.
///
/// # Errors
///
/// - [`HandshakeError::Timeout`] if the whole message did not arrive within
///   `timeout`
/// - [`HandshakeError::ProtocolViolation`] if the first message is not Bind
pub fn read_bind(stream: &mut TcpStream, timeout: Duration) -> Result<BindRequest, HandshakeError> {
    let msg = read_within(stream, timeout)?;
    match msg {
        ControlMessage::Bind(request) => Ok(request),
        ControlMessage::BindAck(_) | ControlMessage::BindReject(_) => Err(
            HandshakeError::ProtocolViolation("expected bind request"),
        ),
    }
}

/// Checks a Bind against the allow-list and the server's connection count.
///
/// # Errors
///
/// Returns the reason to send back in a BindReject.
pub fn validate_bind(
    request: &BindRequest,
    allow: &AllowList,
    expected_count: usize,
) -> Result<(), RejectReason> {
    if !allow.permits(request.client_id) {
        return Err(RejectReason::NotAllowed);
    }
    if usize::from(request.count) != expected_count || request.index >= request.count {
        return Err(RejectReason::CountMismatch);
    }
    Ok(())
}

/// Sends BindAck.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn send_ack(stream: &mut TcpStream, ack: BindAck) -> Result<(), HandshakeError> {
    write_control(stream, &ControlMessage::BindAck(ack)).map_err(HandshakeError::from_control)
}

/// Sends BindReject. The caller closes the stream afterwards.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn send_reject(stream: &mut TcpStream, reason: RejectReason) -> Result<(), HandshakeError> {
    write_control(stream, &ControlMessage::BindReject(reason))
        .map_err(HandshakeError::from_control)
}
