//! Control handshake between tunnel client and server.
//!
//! - `types`: client/connection ids, allow-list, handshake errors
//! - `handshake`: Bind exchange on each TCP connection

pub mod handshake;
pub mod types;

pub use handshake::{client_bind, read_bind, send_ack, send_reject, validate_bind};
pub use types::{AllowList, BIND_TIMEOUT, ClientId, ConnectionId, HandshakeError};
