//! Network transport primitives.
//!
//! - [`Connection`]: one blocking TCP socket of a virtual channel
//! - [`UdpSocket`]: mio-backed UDP socket with bounded-wait receive
//! - [`Endpoint`]: address type shared by both

pub mod connection;
pub mod endpoint;
pub mod socket;

pub use connection::{
    Connection, ConnectionError, ConnectionOptions, DEFAULT_SEND_TIMEOUT, SendTimeoutHandler,
};
pub use endpoint::Endpoint;
pub use socket::UdpSocket;
