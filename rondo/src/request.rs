//! Requests and their completion callbacks.
//!
//! A [`Request`] pairs a [`Command`] with a [`Completion`]. Ownership moves
//! from the caller into a worker's inbox, from the inbox onto a connection,
//! and ends when the completion runs. The completion's callback is an
//! `FnOnce` held in an `Option`, so it can run at most once; dropping a
//! completion that never ran invokes the callback with `None`, so it also
//! runs at least once.
//!
//! # Callback discipline
//!
//! Callbacks run on whichever thread resolves the request (see
//! [`FailureReason`]). They must not panic: a panicking callback aborts the
//! process, since unwinding through a worker's I/O state would leave other
//! requests on that worker in an unknown state. Callbacks must also not block
//! for long, since every other connection on the same worker waits for them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;

use crate::protocol::Reply;
use crate::trace::{error, trace};

/// Callback invoked with the reply, or `None` if the request failed.
pub type Callback = Box<dyn FnOnce(Option<&Reply>) + Send + 'static>;

/// An ordered list of binary-safe arguments, command name first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with its name.
    #[must_use]
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends an argument without copying.
    #[must_use]
    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.args.push(arg);
        self
    }

    /// Returns all arguments, command name first.
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the command name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(|a| &a[..])
    }

    /// Returns the number of arguments including the name.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns `true` if the command has no name.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl<A: AsRef<[u8]>> FromIterator<A> for Command {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self {
            args: iter
                .into_iter()
                .map(|a| Bytes::copy_from_slice(a.as_ref()))
                .collect(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", arg.escape_ascii())?;
        }
        Ok(())
    }
}

/// Why a request completed without a reply.
///
/// Callers only ever observe `None`; the reason exists for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Submitted while the client was not started. Runs on the caller's thread.
    NotStarted,
    /// The target worker had already closed its inbox. Runs on the caller's thread.
    WorkerExited,
    /// Still queued when `stop()` began. Runs on the owning worker thread.
    DrainedOnStop,
    /// Connection error or undecodable reply while in flight. Runs on the
    /// owning worker thread.
    Transport,
    /// Dropped without being resolved.
    Abandoned,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::WorkerExited => write!(f, "worker-exited"),
            Self::DrainedOnStop => write!(f, "drained-on-stop"),
            Self::Transport => write!(f, "transport"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Owner of a request's callback.
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    /// Wraps a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Option<&Reply>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Runs the callback with a decoded reply.
    pub fn complete(mut self, reply: &Reply) {
        if let Some(callback) = self.callback.take() {
            invoke(callback, Some(reply));
        }
    }

    /// Runs the callback with `None`.
    pub fn fail(mut self, _reason: FailureReason) {
        if let Some(callback) = self.callback.take() {
            trace!(reason = %_reason, "request failed");
            invoke(callback, None);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            trace!(reason = %FailureReason::Abandoned, "request failed");
            invoke(callback, None);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Runs a callback, aborting the process if it panics.
fn invoke(callback: Callback, reply: Option<&Reply>) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(reply))).is_err() {
        error!("request callback panicked, aborting");
        std::process::abort();
    }
}

/// A command together with the callback that resolves it.
#[derive(Debug)]
pub struct Request {
    command: Command,
    completion: Completion,
}

impl Request {
    /// Creates a request.
    pub fn new<F>(command: Command, callback: F) -> Self
    where
        F: FnOnce(Option<&Reply>) + Send + 'static,
    {
        Self {
            command,
            completion: Completion::new(callback),
        }
    }

    /// Returns the command.
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// Fails the request without sending it.
    pub fn fail(self, reason: FailureReason) {
        self.completion.fail(reason);
    }

    /// Splits the request for dispatch onto a connection.
    #[must_use]
    pub fn into_parts(self) -> (Command, Completion) {
        (self.command, self.completion)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, impl FnOnce(Option<&Reply>) + Send) {
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let (ok2, failed2) = (Arc::clone(&ok), Arc::clone(&failed));
        let cb = move |reply: Option<&Reply>| {
            if reply.is_some() {
                ok2.fetch_add(1, Ordering::SeqCst);
            } else {
                failed2.fetch_add(1, Ordering::SeqCst);
            }
        };
        (ok, failed, cb)
    }

    #[test]
    fn command_builder_and_iterator() {
        let built = Command::new("SET").arg("k").arg(b"v".as_slice());
        let collected: Command = ["SET", "k", "v"].into_iter().collect();
        assert_eq!(built, collected);
        assert_eq!(built.len(), 3);
        assert_eq!(built.name(), Some(&b"SET"[..]));
        assert_eq!(built.to_string(), "SET k v");
        assert!(Command::default().is_empty());
    }

    #[test]
    fn complete_runs_callback_once_with_reply() {
        let (ok, failed, cb) = counting();
        let completion = Completion::new(cb);
        completion.complete(&Reply::Status("OK".into()));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fail_runs_callback_once_with_none() {
        let (ok, failed, cb) = counting();
        Request::new(Command::new("PING"), cb).fail(FailureReason::NotStarted);
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_unresolved_request_fails_it() {
        let (ok, failed, cb) = counting();
        drop(Request::new(Command::new("PING"), cb));
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn into_parts_keeps_completion_pending() {
        let (ok, failed, cb) = counting();
        let (command, completion) = Request::new(Command::new("GET").arg("k"), cb).into_parts();
        assert_eq!(command.args().len(), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        completion.complete(&Reply::Nil);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }
}
