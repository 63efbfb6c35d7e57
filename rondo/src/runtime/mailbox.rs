//! Per-worker inbox shared between caller threads and one worker thread.
//!
//! Invariants, all maintained under the single mailbox mutex:
//! - The inbox is `Open` from creation until the worker closes it on its way
//!   out; once `Closed` it never reopens and producers get their request
//!   back instead of appending.
//! - The notifier is `Some` only between the worker attaching its reactor and
//!   the worker closing the inbox, so a producer never signals a reactor that
//!   is still being built or already torn down.
//! - A shutdown request, once recorded, is observed by the worker in the same
//!   critical section that closes the inbox. Nothing appended afterwards can
//!   be silently lost.

use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;

use super::reactor::Notifier;
use crate::request::Request;

/// How a worker winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Fail everything still queued; finish what is in flight.
    Stop,
    /// Dispatch everything still queued; finish it all.
    Join,
}

impl ShutdownMode {
    /// Operation name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Join => "join",
        }
    }
}

/// Worker lifecycle as seen from outside the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Spawned but reactor not yet attached.
    Unknown,
    /// Reactor attached, accepting work.
    Running,
    /// Inbox closed, finishing in-flight requests.
    Exiting,
}

/// Queue state; `Closed` replaces the "no inbox" sentinel.
#[derive(Debug)]
enum Inbox {
    Open(VecDeque<Request>),
    Closed,
}

#[derive(Debug)]
struct State {
    lifecycle: Lifecycle,
    inbox: Inbox,
    notifier: Option<Notifier>,
    shutdown: Option<ShutdownMode>,
}

/// Result of a worker draining its mailbox.
#[derive(Debug)]
pub enum Drain {
    /// Requests to dispatch, in submission order.
    Requests(VecDeque<Request>),
    /// Shutdown was requested. The inbox is now closed and `remaining` is
    /// everything that was queued at that instant.
    Shutdown {
        mode: ShutdownMode,
        remaining: VecDeque<Request>,
    },
}

/// Shared handle between producers and the owning worker.
#[derive(Debug)]
pub struct Mailbox {
    state: Mutex<State>,
}

impl Mailbox {
    /// Creates an open, empty mailbox with no reactor attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                lifecycle: Lifecycle::Unknown,
                inbox: Inbox::Open(VecDeque::new()),
                notifier: None,
                shutdown: None,
            }),
        }
    }

    /// Appends a request (any thread).
    ///
    /// The worker is only signalled when the inbox goes from empty to
    /// non-empty: the worker always takes the whole queue, so a non-empty
    /// queue already has a wakeup pending.
    ///
    /// # Errors
    ///
    /// Returns the request if the worker has already closed its inbox.
    pub fn push(&self, request: Request) -> Result<(), Request> {
        let mut state = self.state.lock();
        let State {
            inbox, notifier, ..
        } = &mut *state;
        match inbox {
            Inbox::Open(queue) => {
                let was_empty = queue.is_empty();
                queue.push_back(request);
                if was_empty {
                    if let Some(notifier) = notifier {
                        notifier.notify();
                    }
                }
                Ok(())
            }
            Inbox::Closed => Err(request),
        }
    }

    /// Records a shutdown request and wakes the worker (any thread).
    ///
    /// The first request wins; later ones are ignored.
    pub fn request_shutdown(&self, mode: ShutdownMode) {
        let mut state = self.state.lock();
        if state.shutdown.is_none() {
            state.shutdown = Some(mode);
        }
        if let Some(notifier) = &state.notifier {
            notifier.notify();
        }
    }

    /// Publishes the worker's notifier (worker thread, once).
    pub fn attach(&self, notifier: Notifier) {
        let mut state = self.state.lock();
        if matches!(state.inbox, Inbox::Open(_)) {
            state.notifier = Some(notifier);
            state.lifecycle = Lifecycle::Running;
        }
    }

    /// Takes everything queued, or closes the inbox if shutdown was
    /// requested (worker thread).
    ///
    /// The swap leaves an empty, still-open queue behind so producers keep
    /// appending while the worker dispatches.
    pub fn drain(&self) -> Drain {
        let mut state = self.state.lock();
        if let Some(mode) = state.shutdown {
            let remaining = Self::close_locked(&mut state);
            return Drain::Shutdown { mode, remaining };
        }
        match &mut state.inbox {
            Inbox::Open(queue) => Drain::Requests(mem::take(queue)),
            Inbox::Closed => Drain::Requests(VecDeque::new()),
        }
    }

    /// Closes the inbox and returns whatever was still queued.
    ///
    /// Idempotent: a second call returns an empty queue.
    pub fn close(&self) -> VecDeque<Request> {
        let mut state = self.state.lock();
        Self::close_locked(&mut state)
    }

    fn close_locked(state: &mut State) -> VecDeque<Request> {
        state.lifecycle = Lifecycle::Exiting;
        state.notifier = None;
        match mem::replace(&mut state.inbox, Inbox::Closed) {
            Inbox::Open(queue) => queue,
            Inbox::Closed => VecDeque::new(),
        }
    }

    /// Returns the worker's current lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        match &self.state.lock().inbox {
            Inbox::Open(queue) => queue.len(),
            Inbox::Closed => 0,
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use mio::Token;
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::request::{Command, FailureReason};
    use crate::runtime::reactor::{Reactor, WAKE_TOKEN};

    fn tagged(tag: &'static str, log: &Arc<PlMutex<Vec<(&'static str, bool)>>>) -> Request {
        let log = Arc::clone(log);
        Request::new(Command::new("PING"), move |reply| {
            log.lock().push((tag, reply.is_some()));
        })
    }

    fn names(queue: &VecDeque<Request>) -> Vec<String> {
        queue.iter().map(|r| r.command().to_string()).collect()
    }

    #[test]
    fn drain_preserves_fifo_and_leaves_inbox_open() {
        let mailbox = Mailbox::new();
        for name in ["A", "B", "C"] {
            mailbox.push(Request::new(Command::new(name), |_| {})).unwrap();
        }
        assert_eq!(mailbox.queued(), 3);

        let Drain::Requests(batch) = mailbox.drain() else {
            panic!("expected requests");
        };
        assert_eq!(names(&batch), vec!["A", "B", "C"]);
        assert_eq!(mailbox.queued(), 0);

        // Producers keep appending after a drain.
        mailbox.push(Request::new(Command::new("D"), |_| {})).unwrap();
        assert_eq!(mailbox.queued(), 1);
    }

    #[test]
    fn push_after_close_returns_request() {
        let mailbox = Mailbox::new();
        assert!(mailbox.close().is_empty());
        assert_eq!(mailbox.lifecycle(), Lifecycle::Exiting);

        let log = Arc::new(PlMutex::new(Vec::new()));
        let rejected = mailbox.push(tagged("late", &log)).unwrap_err();
        rejected.fail(FailureReason::WorkerExited);
        assert_eq!(*log.lock(), vec![("late", false)]);
    }

    #[test]
    fn shutdown_drain_closes_and_returns_snapshot() {
        let mailbox = Mailbox::new();
        mailbox.push(Request::new(Command::new("A"), |_| {})).unwrap();
        mailbox.request_shutdown(ShutdownMode::Stop);
        // A later join request doesn't override the first mode.
        mailbox.request_shutdown(ShutdownMode::Join);

        match mailbox.drain() {
            Drain::Shutdown { mode, remaining } => {
                assert_eq!(mode, ShutdownMode::Stop);
                assert_eq!(names(&remaining), vec!["A"]);
            }
            Drain::Requests(_) => panic!("expected shutdown"),
        }
        assert!(mailbox.push(Request::new(Command::new("B"), |_| {})).is_err());
    }

    #[test]
    fn attach_after_close_is_ignored() {
        let mailbox = Mailbox::new();
        mailbox.close();
        let reactor = Reactor::new().unwrap();
        mailbox.attach(reactor.notifier());
        assert_eq!(mailbox.lifecycle(), Lifecycle::Exiting);
    }

    #[test]
    fn push_into_empty_inbox_wakes_attached_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let mailbox = Arc::new(Mailbox::new());
        assert_eq!(mailbox.lifecycle(), Lifecycle::Unknown);
        mailbox.attach(reactor.notifier());
        assert_eq!(mailbox.lifecycle(), Lifecycle::Running);

        let producer = Arc::clone(&mailbox);
        thread::spawn(move || {
            producer
                .push(Request::new(Command::new("PING"), |_| {}))
                .unwrap();
        })
        .join()
        .unwrap();

        reactor.poll(Some(Duration::from_secs(5))).unwrap();
        let tokens: Vec<Token> = reactor.events().map(mio::event::Event::token).collect();
        assert_eq!(tokens, vec![WAKE_TOKEN]);
    }

    #[test]
    fn push_before_attach_is_kept_without_signal() {
        let mailbox = Mailbox::new();
        mailbox.push(Request::new(Command::new("early"), |_| {})).unwrap();

        let mut reactor = Reactor::new().unwrap();
        mailbox.attach(reactor.notifier());
        reactor.poll(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(reactor.events().count(), 0);

        // The worker drains once right after attaching, so nothing is lost.
        let Drain::Requests(batch) = mailbox.drain() else {
            panic!("expected requests");
        };
        assert_eq!(names(&batch), vec!["early"]);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let mailbox = Arc::new(Mailbox::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    for i in 0..250 {
                        let cmd = Command::new(format!("{t}-{i}"));
                        mailbox.push(Request::new(cmd, |_| {})).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            if let Drain::Requests(batch) = mailbox.drain() {
                seen.extend(names(&batch));
            }
        }
        for t in threads {
            t.join().unwrap();
        }

        // Per-producer order survives interleaving.
        for t in 0..4 {
            let prefix = format!("{t}-");
            let mine: Vec<usize> = seen
                .iter()
                .filter_map(|n| n.strip_prefix(&prefix))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(mine, (0..250).collect::<Vec<_>>());
        }
    }
}
