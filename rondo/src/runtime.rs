//! Worker-side runtime.
//!
//! - `reactor`: mio poll loop with a cross-thread wakeup.
//! - `mailbox`: per-worker inbox shared with caller threads.
//! - `connection`: pipelined server connection, owned by one worker.
//! - `worker`: the worker thread itself.

pub mod connection;
pub mod mailbox;
pub mod reactor;
pub mod worker;
