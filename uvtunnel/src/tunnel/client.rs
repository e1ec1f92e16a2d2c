//! Tunnel client.
//!
//! Binds the local UDP port once, then a supervisor thread keeps one session
//! to the server alive:
//!
//! ```text
//! loop {
//!     connect N streams, Bind each (index i of N)
//!     start session (channel + uplink + downlink)
//!     wait for the session to report its end
//!     tear down, sleep reconnect delay
//! }
//! ```

use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::codec::control::BindRequest;
use crate::config::{ClientConfig, ConfigError, TunnelOptions};
use crate::control::{ClientId, client_bind};
use crate::net::{Endpoint, UdpSocket};
use crate::sync::{BlockingQueue, StopSignal, Worker};
use crate::trace::{debug, info, warn};

use super::{ReplyRoute, Services, Session, SessionEnd, TunnelError};

/// Link state reported by [`ClientHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Stopped,
}

struct Status {
    current: Mutex<LinkStatus>,
    changed: Condvar,
    sessions: AtomicU64,
}

impl Status {
    fn lock(&self) -> MutexGuard<'_, LinkStatus> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: LinkStatus) {
        *self.lock() = status;
        self.changed.notify_all();
    }
}

struct Supervisor {
    client_id: ClientId,
    server: Endpoint,
    options: TunnelOptions,
    socket: Arc<UdpSocket>,
    route: Arc<ReplyRoute>,
    services: Arc<Services>,
    events: Arc<BlockingQueue<SessionEnd>>,
    status: Arc<Status>,
}

impl Supervisor {
    fn run(&self, stop: &StopSignal) {
        let mut attempt: u64 = 0;
        while !stop.is_stopped() {
            attempt += 1;
            match self.establish() {
                Ok(session) => {
                    attempt = 0;
                    self.status.sessions.fetch_add(1, Ordering::Relaxed);
                    self.status.set(LinkStatus::Connected);
                    info!(server = %self.server, "tunnel up");

                    let end = self.events.dequeue();
                    self.status.set(LinkStatus::Connecting);
                    drop(session);
                    // Later reports from the same session are stale.
                    while self.events.try_dequeue().is_some() {}

                    match end {
                        Some(end) => warn!(reason = %end, "tunnel lost, reconnecting"),
                        None => break,
                    }
                }
                Err(e) => warn!(attempt, server = %self.server, error = %e, "tunnel setup failed"),
            }
            if !stop.sleep(self.options.reconnect_delay()) {
                break;
            }
        }
        self.status.set(LinkStatus::Stopped);
    }

    fn establish(&self) -> Result<Session, TunnelError> {
        let count = u8::try_from(self.options.connections)
            .map_err(|_| ConfigError::Invalid("connections must fit in a byte".into()))?;
        let server = self.server.as_socket_addr();

        let mut streams = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let mut stream = TcpStream::connect_timeout(&server, self.options.connect_timeout())?;
            let request = BindRequest {
                client_id: self.client_id,
                index,
                count,
            };
            let ack = client_bind(&mut stream, request, self.options.bind_timeout())?;
            debug!(index, connection = %ack.connection_id, "connection bound");
            streams.push(stream);
        }

        let events = Arc::clone(&self.events);
        Session::start(
            format!("client {}", self.client_id),
            streams,
            Arc::clone(&self.socket),
            Arc::clone(&self.route),
            &self.options,
            &self.services,
            Arc::new(move |end| {
                let _ = events.enqueue(end);
            }),
        )
    }
}

/// Entry point for the client side.
pub struct Client;

impl Client {
    /// Binds the local UDP socket and starts the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not resolve, the UDP port cannot
    /// be bound or the supervisor thread cannot be spawned.
    pub fn spawn(config: ClientConfig, services: Arc<Services>) -> Result<ClientHandle, TunnelError> {
        config.validate()?;
        let server = config.server_endpoint()?;
        let socket = Arc::new(UdpSocket::bind(config.local_udp_endpoint()?)?);
        let local_udp = socket.local_addr()?;
        info!(local = %local_udp, server = %server, client = %config.client_id, "client starting");

        let status = Arc::new(Status {
            current: Mutex::new(LinkStatus::Connecting),
            changed: Condvar::new(),
            sessions: AtomicU64::new(0),
        });
        let events = Arc::new(BlockingQueue::new());
        let supervisor = Supervisor {
            client_id: config.client_id,
            server,
            options: config.tunnel,
            socket,
            route: Arc::new(ReplyRoute::learned()),
            services,
            events: Arc::clone(&events),
            status: Arc::clone(&status),
        };
        let worker = Worker::spawn("uvt-supervisor", move |stop| supervisor.run(&stop))?;

        Ok(ClientHandle {
            local_udp,
            status,
            events,
            worker,
        })
    }
}

/// Handle to a running client. Dropping it shuts the client down.
pub struct ClientHandle {
    local_udp: Endpoint,
    status: Arc<Status>,
    events: Arc<BlockingQueue<SessionEnd>>,
    worker: Worker,
}

impl ClientHandle {
    /// Address local applications send their datagrams to.
    #[must_use]
    pub const fn local_udp_addr(&self) -> Endpoint {
        self.local_udp
    }

    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    /// Sessions established so far, reconnects included.
    #[must_use]
    pub fn sessions_started(&self) -> u64 {
        self.status.sessions.load(Ordering::Relaxed)
    }

    /// Blocks until the tunnel is up or `timeout` passes.
    #[must_use]
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let guard = self.status.lock();
        let (guard, _) = self
            .status
            .changed
            .wait_timeout_while(guard, timeout, |s| *s == LinkStatus::Connecting)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == LinkStatus::Connected
    }

    /// Tears down the session and stops the supervisor.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.events.cancel();
        self.worker.stop();
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
