//! Per-worker event loop primitives.
//!
//! A [`Reactor`] is built on, and never leaves, its worker thread. The only
//! piece other threads ever hold is the [`Notifier`], which wraps a
//! [`mio::Waker`] and is safe to signal from anywhere.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};

use crate::trace::warn;

/// Token reserved for the cross-thread wakeup.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Readiness events buffered per poll.
const EVENT_CAPACITY: usize = 256;

/// Single-threaded readiness loop with a cross-thread wakeup.
pub struct Reactor {
    poll: Poll,
    events: Events,
    notifier: Notifier,
}

impl Reactor {
    /// Creates the poller and registers the wakeup source.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller or the waker cannot be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            notifier: Notifier {
                waker: Arc::new(waker),
            },
        })
    }

    /// Returns a handle other threads can use to wake this reactor.
    #[must_use]
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Returns the registry for registering I/O sources.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Blocks until readiness, a wakeup, or the timeout.
    ///
    /// Interrupted waits are retried transparently.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller fails.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the events collected by the last [`Reactor::poll`].
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// Thread-safe handle that wakes a [`Reactor`].
///
/// Wakeups coalesce: several notifications before the reactor runs produce a
/// single `WAKE_TOKEN` event.
#[derive(Clone)]
pub struct Notifier {
    waker: Arc<Waker>,
}

impl Notifier {
    /// Wakes the reactor.
    pub fn notify(&self) {
        if let Err(_e) = self.waker.wake() {
            warn!(error = %_e, "failed to wake worker reactor");
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
