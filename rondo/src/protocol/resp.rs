//! RESP2 codec.
//!
//! # Wire Format
//!
//! Requests are always sent as an array of bulk strings:
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<arg bytes>\r\n      (repeated argc times)
//! ```
//!
//! Replies start with a type byte:
//!
//! | Byte | Kind | Body |
//! |------|------|------|
//! | `+` | status | text up to CRLF |
//! | `-` | error | text up to CRLF |
//! | `:` | integer | decimal up to CRLF |
//! | `$` | bulk | length, CRLF, bytes, CRLF (`$-1` = nil) |
//! | `*` | array | count, CRLF, elements (`*-1` = nil) |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ProtocolCodec, ProtocolError, Reply};
use crate::request::Command;

/// Default upper bound for a single bulk string (same as the server's).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum array nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

const CRLF: &[u8] = b"\r\n";

/// RESP2 request encoder and incremental reply decoder.
///
/// Decoding resumes where the previous call stopped: elements of an array
/// that already arrived are kept, so a reply delivered in many reads is
/// parsed once.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_bulk_len: usize,
    /// Offset into the receive buffer where decoding resumes.
    cursor: usize,
    /// Arrays still waiting for elements, outermost first.
    open: Vec<PartialArray>,
}

#[derive(Debug, Clone)]
struct PartialArray {
    remaining: usize,
    items: Vec<Reply>,
}

impl RespCodec {
    /// Creates a codec with the default bulk limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            cursor: 0,
            open: Vec::new(),
        }
    }

    /// Sets the largest bulk string the decoder accepts.
    #[must_use]
    pub const fn with_max_bulk_len(mut self, max: usize) -> Self {
        self.max_bulk_len = max;
        self
    }

    /// Folds a finished value into the arrays above it. Returns the top-level
    /// reply once the outermost array is complete.
    fn complete(&mut self, mut reply: Reply) -> Option<Reply> {
        loop {
            let Some(parent) = self.open.last_mut() else {
                return Some(reply);
            };
            parent.items.push(reply);
            parent.remaining -= 1;
            if parent.remaining > 0 {
                return None;
            }
            let done = self.open.pop()?;
            reply = Reply::Array(done.items);
        }
    }
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCodec for RespCodec {
    fn encode(&self, command: &Command, dst: &mut BytesMut) {
        let args = command.args();
        let size: usize = args.iter().map(|a| a.len() + 16).sum();
        dst.reserve(size + 16);

        dst.put_u8(b'*');
        put_decimal(dst, args.len());
        for arg in args {
            dst.put_u8(b'$');
            put_decimal(dst, arg.len());
            dst.put_slice(arg);
            dst.put_slice(CRLF);
        }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        loop {
            if self.open.len() > MAX_DEPTH {
                self.reset();
                return Err(ProtocolError::TooDeep(MAX_DEPTH));
            }
            let mut reader = ReplyReader::new(&src[..], self.cursor, self.max_bulk_len);
            let element = match reader.read_element() {
                Ok(element) => element,
                Err(DecodeError::Incomplete) => return Ok(None),
                Err(DecodeError::Invalid(e)) => {
                    self.reset();
                    return Err(e);
                }
            };
            self.cursor = reader.cursor;

            let value = match element {
                Element::Value(reply) => reply,
                Element::Array(0) => Reply::Array(Vec::new()),
                Element::Array(count) => {
                    // Each element needs at least 3 bytes; don't trust the
                    // count beyond what the buffer could possibly hold.
                    let capacity = count.min(reader.remaining() / 3);
                    self.open.push(PartialArray {
                        remaining: count,
                        items: Vec::with_capacity(capacity),
                    });
                    continue;
                }
            };

            if let Some(reply) = self.complete(value) {
                src.advance(self.cursor);
                self.cursor = 0;
                return Ok(Some(reply));
            }
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.open.clear();
    }
}

fn put_decimal(dst: &mut BytesMut, n: usize) {
    dst.put_slice(n.to_string().as_bytes());
    dst.put_slice(CRLF);
}

enum DecodeError {
    /// More bytes are needed.
    Incomplete,
    Invalid(ProtocolError),
}

impl From<ProtocolError> for DecodeError {
    fn from(e: ProtocolError) -> Self {
        Self::Invalid(e)
    }
}

/// One step of a reply: a finished value, or the header of a non-nil array.
enum Element {
    Value(Reply),
    Array(usize),
}

/// Cursor over a receive buffer.
///
/// Nothing is consumed from the buffer itself; a partial element is re-read
/// from its first byte once more bytes arrive.
struct ReplyReader<'a> {
    buf: &'a [u8],
    cursor: usize,
    max_bulk_len: usize,
}

impl<'a> ReplyReader<'a> {
    const fn new(buf: &'a [u8], cursor: usize, max_bulk_len: usize) -> Self {
        Self {
            buf,
            cursor,
            max_bulk_len,
        }
    }

    fn read_element(&mut self) -> Result<Element, DecodeError> {
        let kind = self.take_u8()?;
        match kind {
            b'+' => Ok(Element::Value(Reply::Status(self.take_text()?))),
            b'-' => Ok(Element::Value(Reply::Error(self.take_text()?))),
            b':' => Ok(Element::Value(Reply::Integer(self.take_integer()?))),
            b'$' => self.read_bulk().map(Element::Value),
            b'*' => Ok(match self.take_length()? {
                Some(count) => Element::Array(count),
                None => Element::Value(Reply::Nil),
            }),
            other => Err(ProtocolError::UnknownType(other).into()),
        }
    }

    fn read_bulk(&mut self) -> Result<Reply, DecodeError> {
        let Some(len) = self.take_length()? else {
            return Ok(Reply::Nil);
        };
        if len > self.max_bulk_len {
            return Err(ProtocolError::BulkTooLarge {
                len,
                max: self.max_bulk_len,
            }
            .into());
        }
        if self.remaining() < len + CRLF.len() {
            return Err(DecodeError::Incomplete);
        }
        let start = self.cursor;
        let end = start + len;
        if &self.buf[end..end + CRLF.len()] != CRLF {
            return Err(ProtocolError::MissingTerminator.into());
        }
        self.cursor = end + CRLF.len();
        Ok(Reply::Bulk(Bytes::copy_from_slice(&self.buf[start..end])))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        let Some(&b) = self.buf.get(self.cursor) else {
            return Err(DecodeError::Incomplete);
        };
        self.cursor += 1;
        Ok(b)
    }

    /// Returns the bytes up to the next CRLF and moves past it.
    fn take_line(&mut self) -> Result<&'a [u8], DecodeError> {
        let buf = self.buf;
        let rest = &buf[self.cursor..];
        let Some(pos) = rest.windows(2).position(|w| w == CRLF) else {
            return Err(DecodeError::Incomplete);
        };
        self.cursor += pos + CRLF.len();
        Ok(&rest[..pos])
    }

    fn take_text(&mut self) -> Result<String, DecodeError> {
        let line = self.take_line()?;
        Ok(String::from_utf8_lossy(line).into_owned())
    }

    fn take_integer(&mut self) -> Result<i64, DecodeError> {
        let line = self.take_line()?;
        let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidInteger)?;
        Ok(text
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidInteger)?)
    }

    /// Reads a length header; `-1` means nil.
    fn take_length(&mut self) -> Result<Option<usize>, DecodeError> {
        match self.take_integer()? {
            -1 => Ok(None),
            n if n < 0 => Err(ProtocolError::InvalidLength(n).into()),
            n => usize::try_from(n)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidLength(n).into()),
        }
    }
}
