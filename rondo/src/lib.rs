//! Multi-threaded asynchronous client for a single key-value server.
//!
//! Caller threads submit commands with completion callbacks through
//! [`Client::execute`] without blocking. A fixed pool of worker threads, each
//! with its own event loop and a handful of persistent connections, sends the
//! commands and runs the callbacks.
//!
//! Guarantees:
//! - every submitted request gets exactly one callback, with the reply or
//!   with `None` on failure;
//! - requests routed to the same worker are sent in submission order;
//! - connections are only ever touched by the worker that owns them;
//! - [`Client::stop`] fails queued requests and [`Client::join`] finishes
//!   them, both safely against concurrent submitters.
//!
//! Enable the `tracing` feature and call [`init_tracing`] for logs.

pub mod client;
pub mod net;
pub mod protocol;
pub mod request;
pub mod runtime;
mod trace;

pub use client::{Client, ClientConfig, ClientError, ClientStatus};
pub use protocol::{ProtocolCodec, ProtocolError, Reply, RespCodec};
pub use request::{Command, FailureReason};
pub use trace::init_tracing;
