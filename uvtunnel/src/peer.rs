//! Peer admission on the server.
//!
//! A remote client opens a fixed number of TCP connections. The registry
//! collects them per client id until the count is reached; the accept loop
//! then claims the sockets and builds the client's virtual channel.
//!
//! ```text
//! Unknown ──add_peer──► Pending(0) ──add_socket──► Pending(k) ──► Pending(capacity)
//!                           ▲                                          │ claim_sockets
//!                           └────────────── add_peer (reset) ◄── Ready ◄┘
//! ```

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::control::ClientId;
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{debug, info, warn};

/// Admission progress of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Collecting sockets.
    Pending { collected: usize, capacity: usize },
    /// Sockets claimed; the channel has been built.
    Ready,
}

/// Outcome of [`PeerRegistry::add_peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Created,
    /// The peer existed; `closed` held sockets were closed.
    Reset { closed: usize },
}

/// Outcome of [`PeerRegistry::add_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAdmission {
    Pending { collected: usize, capacity: usize },
    /// This socket completed the set.
    Ready,
    /// The peer was already full; the socket has been closed.
    Rejected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("no admission round for client {0}")]
    UnknownPeer(ClientId),
}

struct Peer {
    sockets: Vec<TcpStream>,
    claimed: bool,
    udp: Option<Arc<UdpSocket>>,
    udp_peer: Option<Endpoint>,
}

impl Peer {
    fn new(capacity: usize) -> Self {
        Self {
            sockets: Vec::with_capacity(capacity),
            claimed: false,
            udp: None,
            udp_peer: None,
        }
    }

    /// Closes every held socket and forgets the UDP side.
    fn clear(&mut self) -> usize {
        let closed = self.sockets.len();
        for socket in self.sockets.drain(..) {
            close_socket(socket);
        }
        self.claimed = false;
        self.udp = None;
        self.udp_peer = None;
        closed
    }
}

fn close_socket(socket: TcpStream) {
    // The peer may have reset it already.
    let _ = socket.shutdown(Shutdown::Both);
}

/// Per-client socket collection, shared by handle.
pub struct PeerRegistry {
    capacity: usize,
    peers: Mutex<HashMap<ClientId, Peer>>,
}

impl PeerRegistry {
    /// Creates a registry admitting `capacity` sockets per peer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            peers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an admission round for `id`.
    ///
    /// An existing peer is reset: every socket it still holds is closed and
    /// its count returns to zero.
    pub fn add_peer(&self, id: ClientId) -> Admission {
        let mut peers = self.lock();
        if let Some(peer) = peers.get_mut(&id) {
            let closed = peer.clear();
            info!(client = %id, closed, "peer reset");
            return Admission::Reset { closed };
        }
        peers.insert(id, Peer::new(self.capacity));
        info!(client = %id, capacity = self.capacity, "peer added");
        Admission::Created
    }

    /// Adds one socket to `id`'s admission round.
    ///
    /// A socket beyond capacity is closed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::UnknownPeer`] if no round was started for
    /// `id`; the socket is closed.
    pub fn add_socket(
        &self,
        id: ClientId,
        socket: TcpStream,
    ) -> Result<SocketAdmission, AdmissionError> {
        let mut peers = self.lock();
        let Some(peer) = peers.get_mut(&id) else {
            drop(peers);
            close_socket(socket);
            return Err(AdmissionError::UnknownPeer(id));
        };

        if peer.claimed || peer.sockets.len() >= self.capacity {
            warn!(client = %id, capacity = self.capacity, "peer full, closing extra socket");
            close_socket(socket);
            return Ok(SocketAdmission::Rejected);
        }

        peer.sockets.push(socket);
        let collected = peer.sockets.len();
        debug!(client = %id, collected, capacity = self.capacity, "socket admitted");
        if collected == self.capacity {
            Ok(SocketAdmission::Ready)
        } else {
            Ok(SocketAdmission::Pending {
                collected,
                capacity: self.capacity,
            })
        }
    }

    /// Takes the full socket set out of the registry and marks the peer ready.
    ///
    /// Returns `None` if the peer is unknown, already claimed, or short of
    /// capacity.
    pub fn claim_sockets(&self, id: ClientId) -> Option<Vec<TcpStream>> {
        let mut peers = self.lock();
        let peer = peers.get_mut(&id)?;
        if peer.claimed || peer.sockets.len() < self.capacity {
            return None;
        }
        peer.claimed = true;
        Some(std::mem::take(&mut peer.sockets))
    }

    #[must_use]
    pub fn state(&self, id: ClientId) -> Option<PeerState> {
        self.lock().get(&id).map(|peer| {
            if peer.claimed {
                PeerState::Ready
            } else {
                PeerState::Pending {
                    collected: peer.sockets.len(),
                    capacity: self.capacity,
                }
            }
        })
    }

    /// Sockets counted against `id`'s capacity, claimed ones included.
    #[must_use]
    pub fn socket_count(&self, id: ClientId) -> usize {
        self.lock().get(&id).map_or(0, |peer| {
            if peer.claimed {
                self.capacity
            } else {
                peer.sockets.len()
            }
        })
    }

    /// Records the UDP socket and forward address of `id`'s session.
    pub fn set_udp(&self, id: ClientId, socket: Arc<UdpSocket>, peer: Endpoint) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.udp = Some(socket);
            entry.udp_peer = Some(peer);
        }
    }

    #[must_use]
    pub fn udp_peer(&self, id: ClientId) -> Option<Endpoint> {
        self.lock().get(&id).and_then(|peer| peer.udp_peer)
    }

    /// Forgets `id`, closing anything it still holds.
    pub fn remove(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(&id);
        removed.is_some_and(|mut peer| {
            peer.clear();
            true
        })
    }

    /// Removes every peer.
    pub fn close_all(&self) {
        let peers = std::mem::take(&mut *self.lock());
        for (_, mut peer) in peers {
            peer.clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("capacity", &self.capacity)
            .field("peers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    struct Loopback {
        listener: TcpListener,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        /// Returns (server side, client side).
        fn pair(&self) -> (TcpStream, TcpStream) {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            let (server, _) = self.listener.accept().unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            (server, client)
        }
    }

    fn assert_closed(mut client: TcpStream) {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn collects_until_capacity() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(2);
        let id = ClientId(1);
        assert_eq!(registry.add_peer(id), Admission::Created);

        let (s1, _c1) = net.pair();
        assert_eq!(
            registry.add_socket(id, s1),
            Ok(SocketAdmission::Pending {
                collected: 1,
                capacity: 2
            })
        );
        let (s2, _c2) = net.pair();
        assert_eq!(registry.add_socket(id, s2), Ok(SocketAdmission::Ready));
        assert_eq!(registry.socket_count(id), 2);

        let sockets = registry.claim_sockets(id).unwrap();
        assert_eq!(sockets.len(), 2);
        assert_eq!(registry.state(id), Some(PeerState::Ready));
        assert!(registry.claim_sockets(id).is_none());
    }

    #[test]
    fn extra_socket_is_closed_and_count_capped() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(2);
        let id = ClientId(2);
        registry.add_peer(id);
        let (s1, _c1) = net.pair();
        let (s2, _c2) = net.pair();
        registry.add_socket(id, s1).unwrap();
        registry.add_socket(id, s2).unwrap();

        let (s3, c3) = net.pair();
        assert_eq!(registry.add_socket(id, s3), Ok(SocketAdmission::Rejected));
        assert_eq!(registry.socket_count(id), 2);
        assert_closed(c3);
    }

    #[test]
    fn repeat_add_peer_resets_and_closes() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(3);
        let id = ClientId(3);
        registry.add_peer(id);
        let (s1, c1) = net.pair();
        let (s2, c2) = net.pair();
        registry.add_socket(id, s1).unwrap();
        registry.add_socket(id, s2).unwrap();

        assert_eq!(registry.add_peer(id), Admission::Reset { closed: 2 });
        assert_eq!(registry.socket_count(id), 0);
        assert_eq!(
            registry.state(id),
            Some(PeerState::Pending {
                collected: 0,
                capacity: 3
            })
        );
        assert_closed(c1);
        assert_closed(c2);
    }

    #[test]
    fn reset_after_claim_starts_a_new_round() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(1);
        let id = ClientId(4);
        registry.add_peer(id);
        let (s1, _c1) = net.pair();
        assert_eq!(registry.add_socket(id, s1), Ok(SocketAdmission::Ready));
        let _claimed = registry.claim_sockets(id).unwrap();

        let (late, c_late) = net.pair();
        assert_eq!(registry.add_socket(id, late), Ok(SocketAdmission::Rejected));
        assert_closed(c_late);

        assert_eq!(registry.add_peer(id), Admission::Reset { closed: 0 });
        let (s2, _c2) = net.pair();
        assert_eq!(registry.add_socket(id, s2), Ok(SocketAdmission::Ready));
    }

    #[test]
    fn unknown_peer_socket_is_closed() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(2);
        let (s, c) = net.pair();
        assert_eq!(
            registry.add_socket(ClientId(9), s),
            Err(AdmissionError::UnknownPeer(ClientId(9)))
        );
        assert_closed(c);
    }

    #[test]
    fn remove_and_close_all() {
        let net = Loopback::new();
        let registry = PeerRegistry::new(2);
        registry.add_peer(ClientId(1));
        registry.add_peer(ClientId(2));
        let (s, c) = net.pair();
        registry.add_socket(ClientId(1), s).unwrap();

        let udp = Arc::new(UdpSocket::bind(Endpoint::localhost(0)).unwrap());
        registry.set_udp(ClientId(2), udp, Endpoint::localhost(9));
        assert_eq!(registry.udp_peer(ClientId(2)), Some(Endpoint::localhost(9)));

        assert!(registry.remove(ClientId(1)));
        assert!(!registry.remove(ClientId(1)));
        assert_closed(c);

        registry.close_all();
        assert!(registry.is_empty());
    }
}
