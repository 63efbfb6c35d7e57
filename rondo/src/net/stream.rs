//! TCP stream wrapper for mio-based I/O.
//!
//! Provides a thin wrapper around [`mio::net::TcpStream`] with
//! `WouldBlock`-free read/write helpers and the socket options every server
//! connection wants.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking TCP stream.
///
/// Connection establishment is asynchronous: [`TcpStream::connect`] returns
/// immediately and the stream becomes usable once [`TcpStream::finish_connect`]
/// reports `true` after a readiness event.
pub struct TcpStream {
    inner: MioTcpStream,
}

impl TcpStream {
    /// Starts a non-blocking connect to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or the connect is
    /// rejected immediately.
    pub fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpStream::connect(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Checks whether a pending connect has completed.
    ///
    /// Returns `Ok(false)` while the handshake is still in progress.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the connect failed.
    pub fn finish_connect(&self) -> io::Result<bool> {
        if let Some(e) = self.inner.take_error()? {
            return Err(e);
        }
        match self.inner.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the pending socket error, if any, clearing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be read.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Reads into `buf`, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// `Ok(Some(0))` means the peer closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes from `buf`, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Disables Nagle's algorithm; requests are small and latency-bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Enables TCP keepalive probes so dead peers are eventually noticed.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        // mio doesn't expose SO_KEEPALIVE, so go through rustix
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_keepalive(fd, keepalive)?;
        Ok(())
    }
}

impl AsFd for TcpStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use super::*;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(Endpoint::from(addr)).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !stream.finish_connect().unwrap() {
            assert!(Instant::now() < deadline, "connect did not complete");
            std::thread::sleep(Duration::from_millis(1));
        }
        (stream, peer)
    }

    #[test]
    fn connect_and_exchange_bytes() {
        let (mut stream, mut peer) = connected_pair();

        let mut written = 0;
        while written < 5 {
            if let Some(n) = stream.try_write(&b"hello"[written..]).unwrap() {
                written += n;
            }
        }
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").unwrap();
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < 5 && Instant::now() < deadline {
            let mut chunk = [0u8; 16];
            if let Some(n) = stream.try_read(&mut chunk).unwrap() {
                got.extend_from_slice(&chunk[..n]);
            }
        }
        assert_eq!(&got, b"world");
    }

    #[test]
    fn try_read_empty_returns_none() {
        let (mut stream, _peer) = connected_pair();
        let mut buf = [0u8; 8];
        assert_eq!(stream.try_read(&mut buf).unwrap(), None);
    }

    #[test]
    fn peer_close_reads_zero() {
        let (mut stream, peer) = connected_pair();
        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 8];
        loop {
            if let Some(n) = stream.try_read(&mut buf).unwrap() {
                assert_eq!(n, 0);
                break;
            }
            assert!(Instant::now() < deadline, "close not observed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn socket_options() {
        let (stream, _peer) = connected_pair();
        stream.set_nodelay(true).unwrap();
        stream.set_keepalive(true).unwrap();
        assert!(rustix::net::sockopt::socket_keepalive(stream.as_fd()).unwrap());
    }
}
