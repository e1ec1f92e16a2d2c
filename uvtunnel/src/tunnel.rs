//! Tunnel runtime: sessions, the client supervisor and the server acceptor.
//!
//! A session is one live virtual channel plus the UDP uplink and downlink
//! bridged onto it. Sessions report their own end through a callback; the
//! client supervisor or the server reaper decides what happens next.

pub mod bridge;
pub mod client;
pub mod coalesce;
pub mod server;

use std::io;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::buffer::BufferPool;
use crate::channel::{ChannelError, ChannelHandlers, ConnectionLoss, VirtualChannel};
use crate::codec::uvt::UvtError;
use crate::config::{ConfigError, TunnelOptions};
use crate::control::HandshakeError;
use crate::monitor::{MemoryMonitor, PerformanceMonitor};
use crate::net::UdpSocket;
use crate::sync::Worker;
use crate::trace::info;

pub use bridge::{Downlink, ReplyRoute, spawn_uplink};
pub use client::{Client, ClientHandle, LinkStatus};
pub use coalesce::Coalescer;
pub use server::{Server, ServerHandle};

/// Errors starting or running a tunnel endpoint.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    ConnectionLost(ConnectionLoss),
    /// The downlink found a corrupt datagram stream.
    Corrupt(UvtError),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(loss) => {
                write!(f, "connection {} lost: {}", loss.index, loss.reason)
            }
            Self::Corrupt(e) => write!(f, "{e}"),
        }
    }
}

/// Called from session threads when the session can no longer carry data.
pub type SessionEndHandler = Arc<dyn Fn(SessionEnd) + Send + Sync>;

/// Process-wide helpers shared by every session: buffer pool and monitors,
/// plus their housekeeping threads.
pub struct Services {
    pool: BufferPool,
    memory: Arc<MemoryMonitor>,
    perf: Arc<PerformanceMonitor>,
    housekeeping: Mutex<Vec<Worker>>,
}

impl Services {
    #[must_use]
    pub fn new(options: &TunnelOptions) -> Self {
        let memory = Arc::new(MemoryMonitor::new(options.memory_alert_bytes()));
        let pool = BufferPool::with_monitor(options.pool_config(), Arc::clone(&memory));
        Self {
            pool,
            memory,
            perf: Arc::new(PerformanceMonitor::new()),
            housekeeping: Mutex::new(Vec::new()),
        }
    }

    /// Starts pool trimming, memory reporting and performance reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start_housekeeping(&self, options: &TunnelOptions) -> io::Result<()> {
        let workers = vec![
            self.pool.spawn_trimmer()?,
            self.memory.spawn_reporter()?,
            self.perf.spawn_reporter(options.report_interval())?,
        ];
        self.housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(workers);
        Ok(())
    }

    /// Stops the housekeeping threads.
    pub fn stop(&self) {
        let workers = std::mem::take(
            &mut *self
                .housekeeping
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        drop(workers);
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    #[must_use]
    pub fn perf(&self) -> &Arc<PerformanceMonitor> {
        &self.perf
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(&TunnelOptions::default())
    }
}

/// A virtual channel bridged to a UDP socket.
pub struct Session {
    channel: Arc<VirtualChannel>,
    uplink: Worker,
    downlink: Downlink,
}

impl Session {
    /// Opens the channel over `streams` and starts both bridge directions.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or a thread cannot
    /// be spawned; everything already started is stopped.
    pub fn start(
        label: impl Into<String>,
        streams: Vec<TcpStream>,
        socket: Arc<UdpSocket>,
        route: Arc<ReplyRoute>,
        options: &TunnelOptions,
        services: &Services,
        on_end: SessionEndHandler,
    ) -> Result<Self, TunnelError> {
        let label = label.into();
        let corrupt = Arc::clone(&on_end);
        let downlink = Downlink::spawn(
            Arc::clone(&socket),
            Arc::clone(&route),
            Arc::clone(&services.perf),
            move |e| corrupt(SessionEnd::Corrupt(e)),
        )?;

        let lost = Arc::clone(&on_end);
        let channel = Arc::new(VirtualChannel::open(
            label.clone(),
            streams,
            &options.channel_config(),
            services.pool.clone(),
            ChannelHandlers {
                on_receive: downlink.receive_handler(),
                on_disconnect: Arc::new(move |loss| lost(SessionEnd::ConnectionLost(loss))),
            },
        )?);

        let uplink = spawn_uplink(
            socket,
            Arc::clone(&channel),
            &options.coalesce,
            route,
            Arc::clone(&services.perf),
        )?;

        info!(session = %label, "session started");
        Ok(Self {
            channel,
            uplink,
            downlink,
        })
    }

    #[must_use]
    pub fn channel(&self) -> &VirtualChannel {
        &self.channel
    }

    /// Stops the uplink, closes the channel and drains the downlink.
    pub fn close(&mut self) {
        self.uplink.stop();
        self.channel.close();
        self.downlink.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
