//! One persistent, pipelined connection to the server.
//!
//! A connection is created, driven and dropped on its worker thread only, so
//! it carries no synchronisation. Requests are pipelined: every dispatched
//! command is appended to the write buffer and its completion queued; each
//! decoded reply resolves the oldest queued completion.
//!
//! Reconnection is lazy. A transport error fails everything in flight and
//! leaves the connection `Disconnected`; the next dispatch starts a fresh
//! connect. Failed requests are never retried.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BytesMut};
use mio::event::{Event, Source};
use mio::{Interest, Registry, Token};
use thiserror::Error;

use crate::net::{Endpoint, TcpStream};
use crate::protocol::{ProtocolCodec, ProtocolError};
use crate::request::{Completion, FailureReason, Request};
use crate::trace::{debug, trace, warn};

/// Bytes read from the socket per syscall.
const READ_CHUNK: usize = 16 * 1024;

/// Initial write buffer capacity.
const WRITE_BUFFER_CAPACITY: usize = 4 * 1024;

/// Errors that reset a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket-level failure, including a refused or reset connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The reply stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The server closed the stream.
    #[error("connection closed by server")]
    Closed,
    /// A reply arrived with no request waiting for it.
    #[error("unsolicited reply")]
    UnexpectedReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// A pipelined connection owned by a single worker thread.
pub struct Connection<C: ProtocolCodec> {
    token: Token,
    endpoint: Endpoint,
    codec: C,
    stream: Option<TcpStream>,
    phase: Phase,
    interest: Interest,
    write_buf: BytesMut,
    read_buf: BytesMut,
    in_flight: VecDeque<Completion>,
}

impl<C: ProtocolCodec> Connection<C> {
    /// Creates a connection and starts connecting.
    ///
    /// A failed initial connect is not fatal: it is logged and retried on
    /// the first dispatch.
    pub fn open(token: Token, endpoint: Endpoint, codec: C, registry: &Registry) -> Self {
        let mut conn = Self {
            token,
            endpoint,
            codec,
            stream: None,
            phase: Phase::Disconnected,
            interest: Interest::READABLE,
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_CAPACITY),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            in_flight: VecDeque::new(),
        };
        if let Err(_e) = conn.connect(registry) {
            warn!(
                token = token.0,
                endpoint = %endpoint,
                error = %_e,
                "initial connect failed, will retry on first request"
            );
        }
        conn
    }

    /// Returns `true` when no request is waiting on this connection.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Returns the number of requests awaiting a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Sends a request.
    ///
    /// The completion runs later, on this thread, when the reply arrives or
    /// the connection fails.
    pub fn dispatch(&mut self, request: Request, registry: &Registry) {
        if self.stream.is_none() {
            if let Err(_e) = self.connect(registry) {
                warn!(
                    token = self.token.0,
                    endpoint = %self.endpoint,
                    error = %_e,
                    "reconnect failed"
                );
                request.fail(FailureReason::Transport);
                return;
            }
        }

        let (command, completion) = request.into_parts();
        trace!(token = self.token.0, command = %command, "dispatch");
        self.codec.encode(&command, &mut self.write_buf);
        self.in_flight.push_back(completion);

        if self.phase == Phase::Connected {
            if let Err(e) = self.flush(registry) {
                self.reset(registry, &e);
            }
        }
    }

    /// Handles a readiness event for this connection's token.
    pub fn on_event(&mut self, event: &Event, registry: &Registry) {
        if let Err(e) = self.handle_event(event, registry) {
            self.reset(registry, &e);
        }
    }

    fn handle_event(&mut self, event: &Event, registry: &Registry) -> Result<(), ConnectionError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };

        if event.is_error() {
            let err = stream
                .take_error()?
                .unwrap_or_else(|| io::Error::other("socket error"));
            return Err(err.into());
        }

        if self.phase == Phase::Connecting {
            if !stream.finish_connect()? {
                return Ok(());
            }
            stream.set_nodelay(true)?;
            stream.set_keepalive(true)?;
            self.phase = Phase::Connected;
            debug!(token = self.token.0, endpoint = %self.endpoint, "connected");
        }

        if event.is_readable() || event.is_read_closed() {
            self.read_replies()?;
        }
        self.flush(registry)
    }

    fn connect(&mut self, registry: &Registry) -> io::Result<()> {
        let mut stream = TcpStream::connect(self.endpoint)?;
        let interest = Interest::READABLE | Interest::WRITABLE;
        stream.register(registry, self.token, interest)?;
        self.stream = Some(stream);
        self.phase = Phase::Connecting;
        self.interest = interest;
        Ok(())
    }

    /// Writes as much buffered output as the socket takes, then adjusts
    /// write interest to whether anything is left.
    fn flush(&mut self, registry: &Registry) -> Result<(), ConnectionError> {
        let Some(stream) = &mut self.stream else {
            return Ok(());
        };
        if self.phase != Phase::Connected {
            return Ok(());
        }

        while !self.write_buf.is_empty() {
            match stream.try_write(&self.write_buf)? {
                Some(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Some(n) => self.write_buf.advance(n),
                None => break,
            }
        }

        let wanted = if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != self.interest {
            stream.reregister(registry, self.token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }

    /// Reads until the socket is drained, then resolves every complete reply.
    ///
    /// Replies that arrived before an EOF are still delivered.
    fn read_replies(&mut self) -> Result<(), ConnectionError> {
        let Some(stream) = &mut self.stream else {
            return Ok(());
        };

        let mut closed = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut chunk)? {
                Some(0) => {
                    closed = true;
                    break;
                }
                Some(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                None => break,
            }
        }

        while let Some(reply) = self.codec.decode(&mut self.read_buf)? {
            let Some(completion) = self.in_flight.pop_front() else {
                return Err(ConnectionError::UnexpectedReply);
            };
            completion.complete(&reply);
        }

        if closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    /// Drops the socket and fails everything in flight.
    fn reset(&mut self, registry: &Registry, _error: &ConnectionError) {
        warn!(
            token = self.token.0,
            endpoint = %self.endpoint,
            error = %_error,
            in_flight = self.in_flight.len(),
            "connection reset"
        );
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.deregister(registry);
        }
        self.phase = Phase::Disconnected;
        self.interest = Interest::READABLE;
        self.write_buf.clear();
        self.read_buf.clear();
        self.codec.reset();

        // Detach first: a callback may submit new work, which must not land
        // in the queue being failed.
        let failed = std::mem::take(&mut self.in_flight);
        for completion in failed {
            completion.fail(FailureReason::Transport);
        }
    }
}

impl<C: ProtocolCodec> Drop for Connection<C> {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(
                token = self.token.0,
                in_flight = self.in_flight.len(),
                "dropping connection with requests in flight"
            );
        }
        for completion in self.in_flight.drain(..) {
            completion.fail(FailureReason::Transport);
        }
    }
}
