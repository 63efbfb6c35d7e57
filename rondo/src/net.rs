//! Network transport primitives.
//!
//! Provides the TCP stream wrapper used by worker connections and the
//! endpoint type the client resolves its configured host into.

pub mod endpoint;
pub mod stream;

pub use endpoint::Endpoint;
pub use stream::TcpStream;
