//! UDP-over-TCP tunnel.
//!
//! Datagrams received on a local UDP port are coalesced, carried over a
//! virtual channel of several parallel TCP connections, reassembled in order
//! on the far side and re-emitted as UDP.
//!
//! - [`codec`]: channel frames, UVT sub-frames and handshake messages
//! - [`channel`]: the virtual channel and its reorder stage
//! - [`tunnel`]: client supervisor, server acceptor and the UDP bridge
//! - [`peer`]: server-side connection admission
//! - [`buffer`], [`monitor`], [`sync`], [`net`]: supporting runtime pieces

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod control;
pub mod monitor;
pub mod net;
pub mod peer;
pub mod sync;
pub mod tunnel;

mod trace;

pub use trace::{DEFAULT_FILTER, init_tracing, init_tracing_with};
