//! UDP socket with bounded-wait receive.
//!
//! Wraps a non-blocking [`mio::net::UdpSocket`] registered with its own
//! [`Poll`]. The receiving thread waits through [`UdpSocket::recv_timeout`] so
//! it can observe a stop flag between waits; any thread may send.

use std::io::{self, ErrorKind};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};

use super::Endpoint;

const SOCKET: Token = Token(0);

struct Readiness {
    poll: Poll,
    events: Events,
}

/// A non-blocking UDP socket shared between one receiver and any senders.
pub struct UdpSocket {
    inner: MioUdpSocket,
    readiness: Mutex<Readiness>,
}

impl UdpSocket {
    /// Binds a socket to `endpoint` and registers it for read readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use)
    /// or the poller cannot be created.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let mut inner = MioUdpSocket::bind(endpoint.into())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut inner, SOCKET, Interest::READABLE)?;
        Ok(Self {
            inner,
            readiness: Mutex::new(Readiness {
                poll,
                events: Events::with_capacity(4),
            }),
        })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends one datagram to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including `WouldBlock` when the send
    /// buffer is full.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receives one datagram, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. Readiness is edge
    /// triggered, so the socket is always drained with a receive attempt
    /// before the poller is consulted.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, Endpoint)>> {
        if let Some(received) = self.try_recv_from(buf)? {
            return Ok(Some(received));
        }
        {
            let mut guard = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
            let Readiness { poll, events } = &mut *guard;
            match poll.poll(events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
                Err(e) => return Err(e),
            }
            if events.is_empty() {
                return Ok(None);
            }
        }
        self.try_recv_from(buf)
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local", &self.inner.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bind_assigns_port() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn recv_timeout_expires_without_data() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        let started = std::time::Instant::now();
        let got = socket
            .recv_timeout(&mut buf, Duration::from_millis(30))
            .unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn recv_timeout_wakes_on_datagram() {
        let receiver = Arc::new(UdpSocket::bind(Endpoint::localhost(0)).unwrap());
        let dest = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let from = sender.local_addr().unwrap();

        let rx = Arc::clone(&receiver);
        let waiter = thread::spawn(move || {
            let mut buf = [0u8; 64];
            for _ in 0..50 {
                if let Some((n, src)) = rx.recv_timeout(&mut buf, Duration::from_millis(100)).unwrap()
                {
                    return (buf[..n].to_vec(), src);
                }
            }
            panic!("no datagram");
        });

        thread::sleep(Duration::from_millis(20));
        sender.send_to(b"hello", dest).unwrap();
        let (payload, src) = waiter.join().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(src, from);
    }

    #[test]
    fn queued_datagrams_all_received() {
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let dest = receiver.local_addr().unwrap();
        for i in 0..5u8 {
            sender.send_to(&[i; 8], dest).unwrap();
        }

        let mut buf = [0u8; 64];
        let mut seen = Vec::new();
        while seen.len() < 5 {
            if let Some((n, _)) = receiver
                .recv_timeout(&mut buf, Duration::from_millis(500))
                .unwrap()
            {
                assert_eq!(n, 8);
                seen.push(buf[0]);
            } else {
                break;
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
