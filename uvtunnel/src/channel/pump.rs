//! Per-connection reader and writer loops.
//!
//! Responsibilities:
//! - Reader: accumulate socket bytes, decode frames, hand each payload to the
//!   channel's reorder stage. Stops on close, read failure or a corrupt frame.
//! - Writer: take frames from the shared send queue and write them. A send
//!   timeout has already re-enqueued the frame through the connection's
//!   handler; a timeout after a partial write also ends the connection.

use crate::codec::{Decode, MAX_FRAME_LEN, decode_frame};
use crate::net::{Connection, ConnectionError};
use crate::sync::StopSignal;
use crate::trace::{debug, trace, warn};

use super::{LossReason, Shared};

impl From<&ConnectionError> for LossReason {
    fn from(e: &ConnectionError) -> Self {
        match e {
            ConnectionError::Closed => Self::Closed,
            ConnectionError::SendTimeout { written, len } => Self::PartialWrite {
                written: *written,
                len: *len,
            },
            ConnectionError::Io(io) => Self::Io(io.kind()),
        }
    }
}

/// Reader loop. Returns when the connection ends.
pub(crate) fn run_reader(conn: &Connection, shared: &Shared, stop: &StopSignal, read_chunk: usize) {
    let mut chunk = vec![0u8; read_chunk.max(MAX_FRAME_LEN)];
    let mut pending: Vec<u8> = Vec::with_capacity(2 * MAX_FRAME_LEN);

    while !stop.is_stopped() {
        let n = match conn.receive(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                debug!(connection = conn.index(), error = %e, "reader stopping");
                shared.connection_lost(conn, LossReason::from(&e));
                return;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        let mut offset = 0;
        loop {
            match decode_frame(&pending[offset..]) {
                Decode::Complete { frame, consumed } => {
                    trace!(
                        connection = conn.index(),
                        id = %frame.message_id,
                        len = frame.payload.len(),
                        "frame received"
                    );
                    let payload = shared.pool().copy_from(frame.payload);
                    shared.accept(frame.message_id, payload);
                    offset += consumed;
                }
                Decode::NeedMoreData => break,
                Decode::Fatal(e) => {
                    warn!(connection = conn.index(), error = %e, "undecodable frame");
                    shared.connection_lost(conn, LossReason::Corrupt(e));
                    return;
                }
            }
        }
        pending.drain(..offset);
    }
}

/// Writer loop. Returns on queue cancellation or when the connection ends.
pub(crate) fn run_writer(conn: &Connection, shared: &Shared) {
    while let Some(frame) = shared.send_queue().dequeue() {
        if !conn.is_connected() {
            // Leave the frame for a connection that is still up.
            let _ = shared.send_queue().enqueue(frame);
            return;
        }
        match conn.send(frame) {
            Ok(()) => {}
            Err(ConnectionError::SendTimeout { written: 0, .. }) => {}
            Err(e) => {
                shared.connection_lost(conn, LossReason::from(&e));
                return;
            }
        }
    }
    trace!(connection = conn.index(), "send queue cancelled");
}
