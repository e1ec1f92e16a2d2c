//! One physical TCP connection of a virtual channel.
//!
//! The socket is blocking. Sends are bounded by a write timeout; a send that
//! times out hands its frame, unmodified, to the connection's send-timeout
//! handler so the channel can retransmit it elsewhere. Disconnecting shuts
//! the socket down in both directions, which also wakes a blocked reader.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::buffer::PooledBuffer;
use crate::trace::{debug, warn};

/// Default per-send socket timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1800);

/// Receives frames whose send timed out.
pub type SendTimeoutHandler = Box<dyn Fn(PooledBuffer) + Send + Sync>;

/// Socket options applied when a connection is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub send_timeout: Duration,
    pub nodelay: bool,
    /// `SO_SNDBUF` override; kernel default when `None`.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF` override; kernel default when `None`.
    pub recv_buffer_size: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            nodelay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Errors from [`Connection`] I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The write timed out after `written` of `len` bytes; the frame went to
    /// the send-timeout handler.
    #[error("send timed out after {written} of {len} bytes")]
    SendTimeout { written: usize, len: usize },
    /// Peer closed the stream, or it was disconnected locally.
    #[error("connection closed")]
    Closed,
    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive owner of one TCP socket.
pub struct Connection {
    index: usize,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    connected: AtomicBool,
    on_send_timeout: Mutex<Option<SendTimeoutHandler>>,
}

impl Connection {
    /// Wraps `stream` and applies `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket option cannot be set.
    pub fn new(index: usize, stream: TcpStream, options: &ConnectionOptions) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(options.nodelay)?;
        stream.set_write_timeout(Some(options.send_timeout))?;
        stream.set_read_timeout(None)?;
        if let Some(size) = options.send_buffer_size {
            rustix::net::sockopt::set_socket_send_buffer_size(stream.as_fd(), size)?;
        }
        if let Some(size) = options.recv_buffer_size {
            rustix::net::sockopt::set_socket_recv_buffer_size(stream.as_fd(), size)?;
        }
        let peer = stream.peer_addr().ok();
        Ok(Self {
            index,
            stream,
            peer,
            connected: AtomicBool::new(true),
            on_send_timeout: Mutex::new(None),
        })
    }

    /// Position of this connection within its channel.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Installs the handler that receives frames whose send timed out.
    pub fn set_on_send_timeout(&self, handler: SendTimeoutHandler) {
        *self
            .on_send_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Writes the whole frame.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::SendTimeout`] if the socket timeout fired; the
    ///   frame has been passed to the send-timeout handler
    /// - [`ConnectionError::Closed`] if the stream is closed
    /// - [`ConnectionError::Io`] on any other failure; the frame is dropped
    pub fn send(&self, frame: PooledBuffer) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        let len = frame.len();
        let mut written = 0;
        while written < len {
            match (&self.stream).write(&frame[written..]) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    debug!(connection = self.index, written, len, "send timed out");
                    self.hand_off(frame);
                    return Err(ConnectionError::SendTimeout { written, len });
                }
                Err(e) if !self.is_connected() => {
                    debug!(connection = self.index, error = %e, "send on disconnected socket");
                    return Err(ConnectionError::Closed);
                }
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }
        Ok(())
    }

    fn hand_off(&self, frame: PooledBuffer) {
        let handler = self
            .on_send_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match handler.as_ref() {
            Some(handler) => handler(frame),
            None => warn!(connection = self.index, "send timeout with no handler, frame dropped"),
        }
    }

    /// Reads available bytes into `buf`, blocking until at least one arrives.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] on end of stream or after a local disconnect
    /// - [`ConnectionError::Io`] on read failure
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        loop {
            match (&self.stream).read(buf) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) if !self.is_connected() => return Err(ConnectionError::Closed),
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }
    }

    /// Shuts the socket down in both directions.
    ///
    /// Returns `true` for the call that actually disconnected; later calls
    /// are no-ops returning `false`.
    pub fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            // Already reset by the peer.
            debug!(connection = self.index, error = %e, "shutdown failed");
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
