//! Identifier and error types for the control handshake.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::control::{ControlError, RejectReason};

/// Timeout for each Bind / BindAck exchange.
pub const BIND_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifier a client presents in its Bind request.
///
/// Statically configured on both sides; the server admits only ids on its
/// [`AllowList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl From<u32> for ClientId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ClientId> for u32 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned identifier of one admitted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Generates a random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Static set of client ids the server accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    ids: HashSet<ClientId>,
}

impl AllowList {
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = ClientId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn permits(&self, id: ClientId) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<ClientId> for AllowList {
    fn from_iter<I: IntoIterator<Item = ClientId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Errors during the Bind handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Framing or transport failure on the control channel.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// No reply within [`BIND_TIMEOUT`].
    #[error("timed out waiting for handshake message")]
    Timeout,
    /// The server refused the connection.
    #[error("bind rejected: {0}")]
    Rejected(RejectReason),
    /// Received a message that is not valid at this point of the exchange.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Socket option setup failed.
    #[error("socket setup failed: {0}")]
    Socket(std::io::Error),
}

impl HandshakeError {
    /// Folds read timeouts reported as I/O errors into [`HandshakeError::Timeout`].
    pub(crate) fn from_control(e: ControlError) -> Self {
        match &e {
            ControlError::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Self::Timeout
            }
            _ => Self::Control(e),
        }
    }
}
