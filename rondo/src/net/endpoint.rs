//! Network endpoint types.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// A resolved server endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`]. Resolution happens once, when the client
/// starts, so worker threads never block on DNS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Resolves `host:port`, preferring the first address returned.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no addresses.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .map(Self)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}:{port}"),
                )
            })
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
