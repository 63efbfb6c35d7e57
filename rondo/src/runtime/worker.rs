//! Worker threads: one reactor and a fixed set of connections each.
//!
//! A worker owns everything it touches except its [`Mailbox`], which it
//! shares with caller threads. It runs until a shutdown request is observed
//! while draining the mailbox, then winds down:
//!
//! - **Stop**: everything still queued is failed, in-flight requests finish.
//! - **Join**: everything still queued is dispatched, then all of it finishes.
//!
//! Either way the thread exits only once no completion remains in flight.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};

use mio::Token;

use super::connection::Connection;
use super::mailbox::{Drain, Mailbox, ShutdownMode};
use super::reactor::{Reactor, WAKE_TOKEN};
use crate::net::Endpoint;
use crate::protocol::ProtocolCodec;
use crate::request::{FailureReason, Request};
use crate::trace::{debug, error, info};

thread_local! {
    static OWNER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Returns `true` when called from a worker thread of the client `owner`,
/// including from inside one of its request callbacks.
pub fn on_worker_of(owner: u64) -> bool {
    OWNER.with(Cell::get) == Some(owner)
}

/// Startup report sent by each worker once its reactor and connections exist.
pub type ReadySender = SyncSender<(usize, io::Result<()>)>;

/// Everything a worker needs to build its I/O state.
#[derive(Debug, Clone)]
pub struct WorkerSetup<C> {
    /// Identity of the client that owns the pool.
    pub owner: u64,
    /// Position in the pool; also used in the thread name.
    pub index: usize,
    /// Server address every connection targets.
    pub endpoint: Endpoint,
    /// Connections to open.
    pub connections: usize,
    /// Codec cloned into each connection.
    pub codec: C,
}

/// Spawns a worker thread.
///
/// The worker reports on `ready` exactly once: `Ok` before entering its loop,
/// or the error that prevented it from starting. On failure it closes its
/// mailbox and fails anything queued before returning.
///
/// # Errors
///
/// Returns an error if the OS refuses to create the thread.
pub fn spawn<C: ProtocolCodec>(
    setup: WorkerSetup<C>,
    mailbox: Arc<Mailbox>,
    ready: ReadySender,
) -> io::Result<JoinHandle<()>> {
    let index = setup.index;
    debug!(worker = index, "spawning worker thread");
    thread::Builder::new()
        .name(format!("rondo-worker-{index}"))
        .spawn(move || {
            OWNER.with(|owner| owner.set(Some(setup.owner)));

            match Worker::new(&setup, Arc::clone(&mailbox)) {
                Ok(worker) => {
                    let _ = ready.send((index, Ok(())));
                    worker.run();
                }
                Err(e) => {
                    error!(worker = index, error = %e, "worker failed to initialise");
                    for request in mailbox.close() {
                        request.fail(FailureReason::WorkerExited);
                    }
                    let _ = ready.send((index, Err(e)));
                }
            }
        })
}

/// I/O state owned by one worker thread.
struct Worker<C: ProtocolCodec> {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    index: usize,
    mailbox: Arc<Mailbox>,
    reactor: Reactor,
    connections: Vec<Connection<C>>,
    next_connection: usize,
}

impl<C: ProtocolCodec> Worker<C> {
    fn new(setup: &WorkerSetup<C>, mailbox: Arc<Mailbox>) -> io::Result<Self> {
        let reactor = Reactor::new()?;
        let connections = (0..setup.connections)
            .map(|i| {
                Connection::open(
                    Token(i),
                    setup.endpoint,
                    setup.codec.clone(),
                    reactor.registry(),
                )
            })
            .collect();

        Ok(Self {
            index: setup.index,
            mailbox,
            reactor,
            connections,
            next_connection: 0,
        })
    }

    fn run(mut self) {
        self.mailbox.attach(self.reactor.notifier());
        info!(
            worker = self.index,
            connections = self.connections.len(),
            "worker running"
        );

        // Anything pushed before attach arrived without a wakeup.
        let mut woken = true;
        let outcome = loop {
            if woken {
                woken = false;
                match self.mailbox.drain() {
                    Drain::Requests(batch) => {
                        for request in batch {
                            self.dispatch(request);
                        }
                    }
                    Drain::Shutdown { mode, remaining } => break Ok((mode, remaining)),
                }
            }

            if let Err(e) = self.reactor.poll(None) {
                break Err(e);
            }
            woken |= self.process_events();
        };

        match outcome {
            Ok((mode, remaining)) => {
                info!(
                    worker = self.index,
                    mode = mode.as_str(),
                    queued = remaining.len(),
                    "worker shutting down"
                );
                match mode {
                    ShutdownMode::Stop => {
                        for request in remaining {
                            request.fail(FailureReason::DrainedOnStop);
                        }
                    }
                    ShutdownMode::Join => {
                        for request in remaining {
                            self.dispatch(request);
                        }
                    }
                }
                self.finish_in_flight();
            }
            Err(_e) => {
                error!(worker = self.index, error = %_e, "reactor failed, worker exiting");
                for request in self.mailbox.close() {
                    request.fail(FailureReason::WorkerExited);
                }
                // In-flight completions fail as the connections drop.
            }
        }

        info!(worker = self.index, "worker exited");
    }

    /// Hands a request to the next connection in round-robin order.
    fn dispatch(&mut self, request: Request) {
        let index = self.next_connection;
        self.next_connection = (index + 1) % self.connections.len().max(1);

        let Self {
            reactor,
            connections,
            ..
        } = self;
        match connections.get_mut(index) {
            Some(conn) => conn.dispatch(request, reactor.registry()),
            None => request.fail(FailureReason::Transport),
        }
    }

    /// Routes the last poll's events. Returns `true` if the mailbox was
    /// signalled.
    fn process_events(&mut self) -> bool {
        let Self {
            reactor,
            connections,
            ..
        } = self;
        let mut woken = false;
        for event in reactor.events() {
            if event.token() == WAKE_TOKEN {
                woken = true;
            } else if let Some(conn) = connections.get_mut(event.token().0) {
                conn.on_event(event, reactor.registry());
            }
        }
        woken
    }

    /// Polls until every connection has resolved its in-flight requests.
    fn finish_in_flight(&mut self) {
        loop {
            let _in_flight: usize = self.connections.iter().map(Connection::in_flight).sum();
            if self.connections.iter().all(Connection::is_idle) {
                return;
            }
            debug!(worker = self.index, in_flight = _in_flight, "waiting for in-flight requests");
            if let Err(_e) = self.reactor.poll(None) {
                error!(worker = self.index, error = %_e, "reactor failed during wind-down");
                return;
            }
            self.process_events();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::{Reply, RespCodec};
    use crate::request::Command;

    /// Accepts connections and answers every `PING` with `+PONG`.
    fn pong_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
                    let mut frame = [0u8; 14];
                    while stream.read_exact(&mut frame).is_ok() {
                        if stream.write_all(b"+PONG\r\n").is_err() {
                            break;
                        }
                    }
                });
            }
        });
        endpoint
    }

    const OWNER_ID: u64 = 7;

    fn setup(endpoint: Endpoint, connections: usize) -> WorkerSetup<RespCodec> {
        WorkerSetup {
            owner: OWNER_ID,
            index: 0,
            endpoint,
            connections,
            codec: RespCodec::new(),
        }
    }

    fn run_worker(mailbox: &Arc<Mailbox>, endpoint: Endpoint) {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let handle = spawn(setup(endpoint, 2), Arc::clone(mailbox), ready_tx).unwrap();
        let (index, result) = ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(index, 0);
        result.unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn stop_fails_queued_requests() {
        let mailbox = Arc::new(Mailbox::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let log = Arc::clone(&log);
            let request = Request::new(Command::new("PING"), move |reply| {
                log.lock().push(reply.cloned());
            });
            mailbox.push(request).unwrap();
        }
        mailbox.request_shutdown(ShutdownMode::Stop);

        run_worker(&mailbox, pong_server());
        assert_eq!(*log.lock(), vec![None, None, None]);
    }

    #[test]
    fn join_dispatches_queued_requests() {
        let mailbox = Arc::new(Mailbox::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let log = Arc::clone(&log);
            let request = Request::new(Command::new("PING"), move |reply| {
                log.lock().push((
                    reply.cloned(),
                    on_worker_of(OWNER_ID),
                    on_worker_of(OWNER_ID + 1),
                ));
            });
            mailbox.push(request).unwrap();
        }
        mailbox.request_shutdown(ShutdownMode::Join);

        run_worker(&mailbox, pong_server());
        let pong = Some(Reply::Status("PONG".into()));
        assert_eq!(
            *log.lock(),
            vec![
                (pong.clone(), true, false),
                (pong.clone(), true, false),
                (pong, true, false)
            ]
        );
        assert!(!on_worker_of(OWNER_ID));
    }

    #[test]
    fn running_worker_serves_requests_until_shutdown() {
        let mailbox = Arc::new(Mailbox::new());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let handle = spawn(setup(pong_server(), 1), Arc::clone(&mailbox), ready_tx).unwrap();
        ready_rx.recv_timeout(Duration::from_secs(5)).unwrap().1.unwrap();

        let (reply_tx, reply_rx) = mpsc::channel();
        let name = Arc::new(Mutex::new(None));
        let name2 = Arc::clone(&name);
        mailbox
            .push(Request::new(Command::new("PING"), move |reply| {
                *name2.lock() = thread::current().name().map(str::to_owned);
                let _ = reply_tx.send(reply.cloned());
            }))
            .unwrap();

        let reply = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply, Some(Reply::Status("PONG".into())));
        assert_eq!(name.lock().as_deref(), Some("rondo-worker-0"));

        mailbox.request_shutdown(ShutdownMode::Stop);
        handle.join().unwrap();
        assert!(mailbox.push(Request::new(Command::new("PING"), |_| {})).is_err());
    }
}
