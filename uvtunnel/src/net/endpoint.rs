//! Network endpoint types.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A network endpoint (IP address + port).
///
/// Used for UDP peers and for the configured tunnel addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// `0.0.0.0:port`.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// `127.0.0.1:port`.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Resolves `host` (IP literal or name) and `port` to its first address.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no address.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .map(Self)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {host}:{port}"),
                )
            })
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_addresses() {
        assert_eq!(Endpoint::any(9000).ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(Endpoint::localhost(3000).ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(Endpoint::localhost(3000).port(), 3000);
    }

    #[test]
    fn resolve_ip_literal() {
        let ep = Endpoint::resolve("127.0.0.1", 7000).unwrap();
        assert_eq!(ep, Endpoint::localhost(7000));
    }

    #[test]
    fn resolve_localhost_name() {
        let ep = Endpoint::resolve("localhost", 53).unwrap();
        assert!(ep.ip().is_loopback());
    }

    #[test]
    fn socket_addr_conversions() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let ep = Endpoint::from(addr);
        assert_eq!(SocketAddr::from(ep), addr);
        assert_eq!(format!("{ep}"), "10.0.0.1:5000");
    }
}
