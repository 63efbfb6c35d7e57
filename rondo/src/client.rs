//! The public client: lifecycle, configuration and request dispatch.
//!
//! A [`Client`] owns a pool of worker threads. Any thread may call
//! [`Client::execute`]; the request is handed to the next worker in round
//! robin order and its callback later runs on that worker.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 stop() / join()
//! Initial ─────────> Starting ─> Started ─────────> Stopping / Joining ─> Initial
//!    ^                  │
//!    └──── (failure) ───┘
//! ```
//!
//! Every transition is a single atomic compare-and-swap, so racing lifecycle
//! calls get a reported [`ClientError::InvalidState`] rather than undefined
//! behaviour.
//!
//! # Example
//!
//! ```no_run
//! use rondo::{Client, ClientConfig, Command};
//!
//! let client = Client::new();
//! client.configure(ClientConfig::default().with_threads(2))?;
//! client.start()?;
//!
//! client.execute(Command::new("PING"), |reply| match reply {
//!     Some(reply) => println!("{reply}"),
//!     None => eprintln!("request failed"),
//! });
//!
//! client.join()?;
//! # Ok::<(), rondo::ClientError>(())
//! ```

use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::net::Endpoint;
use crate::protocol::{ProtocolCodec, Reply, RespCodec};
use crate::request::{Command, FailureReason, Request};
use crate::runtime::mailbox::{Mailbox, ShutdownMode};
use crate::runtime::worker::{self, WorkerSetup};
use crate::trace::{debug, error, info, trace, warn};

/// Default server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default number of worker threads.
pub const DEFAULT_THREADS: usize = 1;
/// Default number of connections each worker opens.
pub const DEFAULT_CONNECTIONS_PER_THREAD: usize = 3;

/// Client configuration. Changeable only while the client is
/// [`ClientStatus::Initial`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Number of worker threads.
    pub threads: usize,
    /// Connections opened by each worker.
    pub connections_per_thread: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            threads: DEFAULT_THREADS,
            connections_per_thread: DEFAULT_CONNECTIONS_PER_THREAD,
        }
    }
}

impl ClientConfig {
    /// Sets the server host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the server port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the number of connections per worker.
    #[must_use]
    pub fn with_connections_per_thread(mut self, connections: usize) -> Self {
        self.connections_per_thread = connections;
        self
    }

    /// Checks the configuration without resolving the host.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::InvalidConfig("host must not be empty"));
        }
        if self.threads == 0 {
            return Err(ClientError::InvalidConfig("threads must be at least 1"));
        }
        if self.connections_per_thread == 0 {
            return Err(ClientError::InvalidConfig(
                "connections_per_thread must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Global client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientStatus {
    /// Not running; configurable.
    Initial = 0,
    /// `start()` is spawning workers.
    Starting = 1,
    /// Accepting requests.
    Started = 2,
    /// `stop()` in progress.
    Stopping = 3,
    /// `join()` in progress.
    Joining = 4,
}

impl ClientStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            4 => Self::Joining,
            _ => Self::Initial,
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Joining => write!(f, "joining"),
        }
    }
}

/// Errors reported by lifecycle operations.
///
/// Request failures never show up here; they reach the request's callback
/// as `None`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation is not legal in the current status.
    #[error("cannot {operation} while client is {status}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Status observed at the time.
        status: ClientStatus,
    },
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The server address did not resolve.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    /// A worker could not build its reactor.
    #[error("worker {index} failed to initialise: {source}")]
    WorkerInit {
        index: usize,
        #[source]
        source: io::Error,
    },
    /// `stop()` or `join()` was called from a worker thread, which would
    /// wait on itself.
    #[error("stop/join called from a worker thread")]
    CalledFromWorker,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Mailboxes of the running workers, indexed by worker.
#[derive(Debug, Default)]
struct WorkerPool {
    mailboxes: Vec<Arc<Mailbox>>,
}

/// Asynchronous client for a single key-value server.
///
/// Shareable across threads (e.g. behind an `Arc`). Only [`Client::execute`]
/// is meant for hot paths; lifecycle calls are cheap but serialise through
/// the status word.
pub struct Client<C: ProtocolCodec = RespCodec> {
    /// Tags this client's worker threads.
    id: u64,
    config: Mutex<ClientConfig>,
    codec: C,
    status: AtomicU8,
    dispatch_seq: AtomicUsize,
    pool: RwLock<Arc<WorkerPool>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Creates a stopped client using the RESP codec and default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(RespCodec::new())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ProtocolCodec> Client<C> {
    /// Creates a stopped client with a custom codec.
    #[must_use]
    pub fn with_codec(codec: C) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            config: Mutex::new(ClientConfig::default()),
            codec,
            status: AtomicU8::new(ClientStatus::Initial as u8),
            dispatch_seq: AtomicUsize::new(0),
            pool: RwLock::new(Arc::default()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns a copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.config.lock().clone()
    }

    /// Replaces the configuration.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidState`] unless the client is `Initial`.
    /// - [`ClientError::InvalidConfig`] if `config` fails validation.
    pub fn configure(&self, config: ClientConfig) -> Result<(), ClientError> {
        // Holding the config lock across the check keeps a concurrent start()
        // from reading a half-applied config.
        let mut current = self.config.lock();
        let status = self.status();
        if status != ClientStatus::Initial {
            return Err(ClientError::InvalidState {
                operation: "configure",
                status,
            });
        }
        config.validate()?;
        debug!(config = ?config, "client configured");
        *current = config;
        Ok(())
    }

    /// Spawns the workers and starts accepting requests.
    ///
    /// Returns once every worker has built its reactor and connections.
    /// Connections that fail their initial connect are retried lazily and do
    /// not fail the start.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidState`] unless the client is `Initial`.
    /// - [`ClientError::InvalidConfig`], [`ClientError::Resolve`],
    ///   [`ClientError::Spawn`] or [`ClientError::WorkerInit`] if the
    ///   workers cannot be brought up; the client is back to `Initial`.
    pub fn start(&self) -> Result<(), ClientError> {
        self.transition(ClientStatus::Initial, ClientStatus::Starting, "start")?;

        match self.launch() {
            Ok(_workers) => {
                self.status
                    .store(ClientStatus::Started as u8, Ordering::Release);
                info!(workers = _workers, "client started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "client failed to start");
                self.status
                    .store(ClientStatus::Initial as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<usize, ClientError> {
        let config = self.config.lock().clone();
        config.validate()?;

        let endpoint = Endpoint::resolve(&config.host, config.port).map_err(|source| {
            ClientError::Resolve {
                host: config.host.clone(),
                port: config.port,
                source,
            }
        })?;
        info!(
            endpoint = %endpoint,
            threads = config.threads,
            connections_per_thread = config.connections_per_thread,
            "client starting"
        );

        let (ready_tx, ready_rx) = mpsc::sync_channel(config.threads);
        let mut mailboxes = Vec::with_capacity(config.threads);
        let mut handles = Vec::with_capacity(config.threads);

        for index in 0..config.threads {
            let mailbox = Arc::new(Mailbox::new());
            let setup = WorkerSetup {
                owner: self.id,
                index,
                endpoint,
                connections: config.connections_per_thread,
                codec: self.codec.clone(),
            };
            match worker::spawn(setup, Arc::clone(&mailbox), ready_tx.clone()) {
                Ok(handle) => {
                    mailboxes.push(mailbox);
                    handles.push(handle);
                }
                Err(e) => {
                    teardown(&mailboxes, handles, ShutdownMode::Stop);
                    return Err(ClientError::Spawn(e));
                }
            }
        }
        drop(ready_tx);

        let mut reported = vec![false; handles.len()];
        let mut failure = None;
        for _ in 0..handles.len() {
            match ready_rx.recv() {
                Ok((index, result)) => {
                    reported[index] = true;
                    if let Err(source) = result {
                        failure.get_or_insert(ClientError::WorkerInit { index, source });
                    }
                }
                Err(mpsc::RecvError) => {
                    // Every sender is gone: some worker died before reporting.
                    let index = reported.iter().position(|r| !r).unwrap_or_default();
                    failure.get_or_insert(ClientError::WorkerInit {
                        index,
                        source: io::Error::other("worker exited before reporting"),
                    });
                    break;
                }
            }
        }
        if let Some(e) = failure {
            teardown(&mailboxes, handles, ShutdownMode::Stop);
            return Err(e);
        }

        let workers = mailboxes.len();
        *self.pool.write() = Arc::new(WorkerPool { mailboxes });
        *self.threads.lock() = handles;
        self.dispatch_seq.store(0, Ordering::Relaxed);
        Ok(workers)
    }

    /// Submits a command. Never blocks on I/O.
    ///
    /// The callback runs exactly once: with the reply on the worker thread
    /// that sent it, or with `None` if the request failed. If the client is
    /// not started, or the chosen worker has already exited, it runs with
    /// `None` on the calling thread before this returns.
    ///
    /// The callback must not panic (doing so aborts the process) and should
    /// not block. The reply is only borrowed for the duration of the call.
    pub fn execute<F>(&self, command: Command, callback: F)
    where
        F: FnOnce(Option<&Reply>) + Send + 'static,
    {
        let request = Request::new(command, callback);

        if self.status() != ClientStatus::Started {
            trace!(command = %request.command(), "rejected: client not started");
            request.fail(FailureReason::NotStarted);
            return;
        }

        let pool = Arc::clone(&self.pool.read());
        if pool.mailboxes.is_empty() {
            request.fail(FailureReason::NotStarted);
            return;
        }
        let target = self.dispatch_seq.fetch_add(1, Ordering::Relaxed) % pool.mailboxes.len();

        if let Err(rejected) = pool.mailboxes[target].push(request) {
            trace!(worker = target, "rejected: worker exited");
            rejected.fail(FailureReason::WorkerExited);
        }
    }

    /// Stops the client, failing every request still queued.
    ///
    /// Requests already sent complete normally. Blocks until every worker
    /// thread has exited.
    ///
    /// # Errors
    ///
    /// - [`ClientError::CalledFromWorker`] when called from a callback of
    ///   this client.
    /// - [`ClientError::InvalidState`] unless the client is `Started`.
    pub fn stop(&self) -> Result<(), ClientError> {
        self.shutdown(ShutdownMode::Stop)
    }

    /// Stops the client after every queued request has completed.
    ///
    /// Requests submitted after this call begins are rejected. Blocks until
    /// every worker thread has exited.
    ///
    /// # Errors
    ///
    /// - [`ClientError::CalledFromWorker`] when called from a callback of
    ///   this client.
    /// - [`ClientError::InvalidState`] unless the client is `Started`.
    pub fn join(&self) -> Result<(), ClientError> {
        self.shutdown(ShutdownMode::Join)
    }

    fn shutdown(&self, mode: ShutdownMode) -> Result<(), ClientError> {
        if worker::on_worker_of(self.id) {
            return Err(ClientError::CalledFromWorker);
        }
        let next = match mode {
            ShutdownMode::Stop => ClientStatus::Stopping,
            ShutdownMode::Join => ClientStatus::Joining,
        };
        self.transition(ClientStatus::Started, next, mode.as_str())?;
        info!(mode = mode.as_str(), "client shutting down");

        let pool = Arc::clone(&self.pool.read());
        let handles = mem::take(&mut *self.threads.lock());
        teardown(&pool.mailboxes, handles, mode);

        *self.pool.write() = Arc::default();
        self.status
            .store(ClientStatus::Initial as u8, Ordering::Release);
        info!(mode = mode.as_str(), "client stopped");
        Ok(())
    }

    fn transition(
        &self,
        from: ClientStatus,
        to: ClientStatus,
        operation: &'static str,
    ) -> Result<(), ClientError> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|actual| ClientError::InvalidState {
                operation,
                status: ClientStatus::from_u8(actual),
            })
    }
}

impl<C: ProtocolCodec> Drop for Client<C> {
    fn drop(&mut self) {
        if self.status() != ClientStatus::Started {
            return;
        }
        if !worker::on_worker_of(self.id) {
            if let Err(_e) = self.stop() {
                warn!(error = %_e, "client dropped while started and could not stop");
            }
            return;
        }

        // The last handle went away inside a callback. Joining would wait on
        // this thread, so the workers are told to stop and left to exit alone.
        let pool = mem::take(self.pool.get_mut());
        for mailbox in &pool.mailboxes {
            mailbox.request_shutdown(ShutdownMode::Stop);
        }
        let _detached = mem::take(self.threads.get_mut());
        self.status
            .store(ClientStatus::Initial as u8, Ordering::Release);
        warn!(
            workers = pool.mailboxes.len(),
            "client dropped from its own callback, workers detached"
        );
    }
}

impl<C: ProtocolCodec> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .field("config", &*self.config.lock())
            .field(
                "workers",
                &self
                    .pool
                    .read()
                    .mailboxes
                    .iter()
                    .map(|mailbox| mailbox.lifecycle())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Asks every worker to wind down, waits for them, then fails anything a
/// worker left behind.
fn teardown(mailboxes: &[Arc<Mailbox>], handles: Vec<JoinHandle<()>>, mode: ShutdownMode) {
    for mailbox in mailboxes {
        mailbox.request_shutdown(mode);
    }
    for (_index, handle) in handles.into_iter().enumerate() {
        debug!(worker = _index, "waiting for worker to exit");
        if handle.join().is_err() {
            error!(worker = _index, "worker thread panicked");
        }
    }
    // A worker that died without draining leaves its inbox open.
    for mailbox in mailboxes {
        for request in mailbox.close() {
            request.fail(FailureReason::WorkerExited);
        }
    }
}
