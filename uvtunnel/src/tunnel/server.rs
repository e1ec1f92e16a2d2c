//! Tunnel server.
//!
//! The acceptor thread hands every incoming connection to a short-lived
//! handshake thread, so an idle or slow peer never holds up the others. A
//! handshake that completes feeds its socket to the [`PeerRegistry`]. When a
//! client's set is complete its session starts, bridged to a fresh UDP socket
//! that talks to the forward address.
//!
//! Session ends are reported to a reaper thread. Each session carries a
//! generation number so a late report from a replaced session is ignored.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::codec::control::{BindAck, RejectReason};
use crate::config::{ServerConfig, TunnelOptions};
use crate::control::{
    AllowList, ClientId, ConnectionId, read_bind, send_ack, send_reject, validate_bind,
};
use crate::net::{Endpoint, UdpSocket};
use crate::peer::{Admission, PeerRegistry, PeerState, SocketAdmission};
use crate::sync::{BlockingQueue, Worker};
use crate::trace::{debug, error, info, warn};

use super::{ReplyRoute, Services, Session, SessionEnd, TunnelError};

const LISTENER: Token = Token(0);

/// Upper bound on one accept wait, so stop requests are noticed.
const ACCEPT_WAIT: Duration = Duration::from_millis(100);

/// Handshakes allowed in flight at once; further connections are dropped.
const MAX_PENDING_HANDSHAKES: usize = 64;

struct EndReport {
    client: ClientId,
    generation: u64,
    end: SessionEnd,
}

struct LiveSession {
    generation: u64,
    session: Session,
}

struct ServerShared {
    allow: AllowList,
    forward: Endpoint,
    options: TunnelOptions,
    services: Arc<Services>,
    registry: PeerRegistry,
    sessions: Mutex<HashMap<ClientId, LiveSession>>,
    ends: Arc<BlockingQueue<EndReport>>,
    generation: AtomicU64,
    handshakes: AtomicUsize,
    closed: AtomicBool,
}

/// Releases a handshake slot when the handshake thread finishes.
struct HandshakeSlot(Arc<ServerShared>);

impl Drop for HandshakeSlot {
    fn drop(&mut self) {
        self.0.handshakes.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ServerShared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<ClientId, LiveSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the handshake for `stream` on its own thread.
    fn spawn_handshake(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.handshakes.fetch_add(1, Ordering::AcqRel) >= MAX_PENDING_HANDSHAKES {
            self.handshakes.fetch_sub(1, Ordering::AcqRel);
            warn!(peer = %peer, "too many pending handshakes, connection dropped");
            return;
        }
        let slot = HandshakeSlot(Arc::clone(self));
        let spawned = thread::Builder::new()
            .name("uvt-bind".into())
            .spawn(move || {
                slot.0.admit(stream, peer);
                drop(slot);
            });
        if let Err(e) = spawned {
            error!(peer = %peer, error = %e, "cannot spawn handshake thread");
        }
    }

    fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(peer = %peer, error = %e, "cannot configure accepted socket");
            return;
        }
        let request = match read_bind(&mut stream, self.options.bind_timeout()) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %peer, error = %e, "handshake failed");
                return;
            }
        };
        let id = request.client_id;
        debug!(peer = %peer, client = %id, index = request.index, count = request.count, "bind received");

        if let Err(reason) = validate_bind(&request, &self.allow, self.registry.capacity()) {
            reject(stream, id, reason);
            return;
        }

        if request.index == 0 {
            if let Admission::Reset { .. } = self.registry.add_peer(id) {
                self.end_session(id);
            }
        }

        match self.registry.state(id) {
            None => return reject(stream, id, RejectReason::UnknownPeer),
            Some(PeerState::Ready) => return reject(stream, id, RejectReason::PeerFull),
            Some(PeerState::Pending {
                collected,
                capacity,
            }) if collected >= capacity => return reject(stream, id, RejectReason::PeerFull),
            Some(PeerState::Pending { .. }) => {}
        }

        let ack = BindAck {
            connection_id: ConnectionId::generate(),
            index: request.index,
        };
        if let Err(e) = send_ack(&mut stream, ack) {
            debug!(client = %id, error = %e, "ack not delivered");
            return;
        }

        match self.registry.add_socket(id, stream) {
            Ok(SocketAdmission::Ready) => self.start_session(id),
            Ok(SocketAdmission::Pending {
                collected,
                capacity,
            }) => debug!(client = %id, collected, capacity, "waiting for more connections"),
            Ok(SocketAdmission::Rejected) => {}
            Err(e) => warn!(error = %e, "socket not admitted"),
        }
    }

    fn start_session(&self, id: ClientId) {
        let Some(streams) = self.registry.claim_sockets(id) else {
            return;
        };
        let unspecified = match self.forward.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = match UdpSocket::bind(Endpoint::new(unspecified, 0)) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!(client = %id, error = %e, "cannot bind forward socket");
                self.registry.remove(id);
                return;
            }
        };
        self.registry.set_udp(id, Arc::clone(&socket), self.forward);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let ends = Arc::clone(&self.ends);
        let started = Session::start(
            format!("client {id}"),
            streams,
            socket,
            Arc::new(ReplyRoute::fixed(self.forward)),
            &self.options,
            &self.services,
            Arc::new(move |end| {
                let _ = ends.enqueue(EndReport {
                    client: id,
                    generation,
                    end,
                });
            }),
        );
        match started {
            Ok(session) => {
                let mut sessions = self.sessions();
                if self.closed.load(Ordering::Acquire) {
                    drop(sessions);
                    drop(session);
                    return;
                }
                let replaced = sessions.insert(
                    id,
                    LiveSession {
                        generation,
                        session,
                    },
                );
                drop(sessions);
                drop(replaced);
                info!(client = %id, forward = %self.forward, "client connected");
            }
            Err(e) => {
                error!(client = %id, error = %e, "session failed to start");
                self.registry.remove(id);
            }
        }
    }

    fn end_session(&self, id: ClientId) {
        let removed = self.sessions().remove(&id);
        if let Some(live) = removed {
            info!(client = %id, "replacing session");
            drop(live);
        }
    }

    fn reap(&self, report: EndReport) {
        let removed = {
            let mut sessions = self.sessions();
            match sessions.get(&report.client) {
                Some(live) if live.generation == report.generation => {
                    sessions.remove(&report.client)
                }
                _ => None,
            }
        };
        if let Some(live) = removed {
            warn!(client = %report.client, reason = %report.end, "session ended");
            drop(live);
        }
    }

    fn close_sessions(&self) {
        self.closed.store(true, Ordering::Release);
        let sessions = std::mem::take(&mut *self.sessions());
        drop(sessions);
        self.registry.close_all();
    }
}

fn reject(mut stream: TcpStream, id: ClientId, reason: RejectReason) {
    info!(client = %id, reason = %reason, "bind rejected");
    if let Err(e) = send_reject(&mut stream, reason) {
        debug!(client = %id, error = %e, "reject not delivered");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Entry point for the server side.
pub struct Server;

impl Server {
    /// Binds the listening socket and starts the acceptor and reaper.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not resolve, the port cannot be
    /// bound or a thread cannot be spawned.
    pub fn spawn(config: ServerConfig, services: Arc<Services>) -> Result<ServerHandle, TunnelError> {
        config.validate()?;
        let forward = config.forward_endpoint()?;
        let listener = TcpListener::bind(config.listen_endpoint()?.as_socket_addr())?;
        listener.set_nonblocking(true)?;
        let local_addr = Endpoint::from(listener.local_addr()?);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&listener.as_raw_fd()), LISTENER, Interest::READABLE)?;

        let shared = Arc::new(ServerShared {
            allow: config.allow_list(),
            forward,
            registry: PeerRegistry::new(config.tunnel.connections),
            options: config.tunnel,
            services,
            sessions: Mutex::new(HashMap::new()),
            ends: Arc::new(BlockingQueue::new()),
            generation: AtomicU64::new(0),
            handshakes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        info!(
            listen = %local_addr,
            forward = %forward,
            clients = shared.allow.len(),
            "server listening"
        );

        let reaper_shared = Arc::clone(&shared);
        let reaper = Worker::spawn("uvt-reaper", move |_| {
            while let Some(report) = reaper_shared.ends.dequeue() {
                reaper_shared.reap(report);
            }
        })?;

        let acceptor_shared = Arc::clone(&shared);
        let acceptor = Worker::spawn("uvt-acceptor", move |stop| {
            let mut poll = poll;
            let mut events = Events::with_capacity(8);
            while !stop.is_stopped() {
                if let Err(e) = poll.poll(&mut events, Some(ACCEPT_WAIT)) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!(error = %e, "accept poll failed");
                    break;
                }
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => acceptor_shared.spawn_handshake(stream, peer),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
        })?;

        Ok(ServerHandle {
            local_addr,
            shared,
            acceptor,
            reaper,
        })
    }
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct ServerHandle {
    local_addr: Endpoint,
    shared: Arc<ServerShared>,
    acceptor: Worker,
    reaper: Worker,
}

impl ServerHandle {
    /// Address the server accepts tunnel connections on.
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    /// Clients with a live session.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions().len()
    }

    #[must_use]
    pub fn peer_state(&self, id: ClientId) -> Option<PeerState> {
        self.shared.registry.state(id)
    }

    /// Stops accepting, closes every session and forgets every peer.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.acceptor.stop();
        self.shared.ends.cancel();
        self.reaper.stop();
        self.shared.close_sessions();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
