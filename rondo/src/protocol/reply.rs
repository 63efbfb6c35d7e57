//! Decoded server replies.

use std::fmt;

use bytes::Bytes;

/// A decoded reply from the server.
///
/// Callbacks only ever see a `&Reply`; the value is owned by the connection
/// that decoded it and is dropped as soon as the callback returns. Copy out
/// whatever needs to outlive the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string, e.g. `+OK`.
    Status(String),
    /// Server-side error, e.g. `-ERR unknown command`.
    ///
    /// This is still a successful round trip: the request reached the server
    /// and a reply came back.
    Error(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Binary-safe bulk string.
    Bulk(Bytes),
    /// Null bulk string or null array.
    Nil,
    /// Array of nested replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns `true` for a server error reply.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns `true` for a null reply.
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Returns the raw bytes of a status, error or bulk reply.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Status(s) | Self::Error(s) => Some(s.as_bytes()),
            Self::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the reply as UTF-8 text, if it is textual and valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the value of an integer reply.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the elements of an array reply.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "{s}"),
            Self::Error(s) => write!(f, "(error) {s}"),
            Self::Integer(n) => write!(f, "(integer) {n}"),
            Self::Bulk(b) => write!(f, "\"{}\"", b.escape_ascii()),
            Self::Nil => write!(f, "(nil)"),
            Self::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                        write!(f, "{:width$}", "", width = depth * 3)?;
                    }
                    write!(f, "{}) ", i + 1)?;
                    item.fmt_indented(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// Renders the reply the way `redis-cli` does.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
