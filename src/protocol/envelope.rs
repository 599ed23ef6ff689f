//! Wire envelopes: the three message shapes carried inside frames.
//!
//! Every frame payload is a MsgPack array tagged by its first element:
//!
//! - `[0, seqId, method, arg]` — invoke, expects a reply
//! - `[1, seqId, error, result]` — reply, `error` is nil or a string
//! - `[2, method, arg]` — notify, fire-and-forget
//!
//! The `arg` and `result` elements are opaque to the runtime: they stay
//! raw MsgPack bytes end to end and only the caller/handler decodes them.
//! The envelope structure itself (array marker, tag, seq id, method
//! string, nil-or-string error) is built and parsed by hand here; its
//! shape is fixed and small, and partial decoding is exactly what lets
//! the payload tail pass through untouched.

use bytes::Bytes;

use super::packetizer::encode_uint;
use crate::error::{Result, WirecallError};

/// Envelope tag for an invocation expecting a reply.
pub const INVOKE: u64 = 0;
/// Envelope tag for a reply to an invocation.
pub const REPLY: u64 = 1;
/// Envelope tag for a fire-and-forget notification.
pub const NOTIFY: u64 = 2;

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Request expecting a correlated reply.
    Invoke {
        /// Caller-assigned correlation id.
        seq_id: u64,
        /// Qualified `program.method` name.
        method: String,
        /// Raw MsgPack argument.
        arg: Bytes,
    },
    /// Fire-and-forget request.
    Notify {
        /// Qualified `program.method` name.
        method: String,
        /// Raw MsgPack argument.
        arg: Bytes,
    },
    /// Response to an earlier invoke.
    Reply {
        /// The seq id of the invoke being answered.
        seq_id: u64,
        /// Error string, or `None` on success.
        error: Option<String>,
        /// Raw MsgPack result.
        result: Bytes,
    },
}

impl Envelope {
    /// Encode this envelope as a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::Invoke {
                seq_id,
                method,
                arg,
            } => {
                let mut out = Vec::with_capacity(method.len() + arg.len() + 16);
                out.push(0x94); // fixarray, 4 elements
                encode_uint(INVOKE, &mut out);
                encode_uint(*seq_id, &mut out);
                encode_str(method, &mut out);
                out.extend_from_slice(arg);
                out
            }
            Envelope::Notify { method, arg } => {
                let mut out = Vec::with_capacity(method.len() + arg.len() + 8);
                out.push(0x93); // fixarray, 3 elements
                encode_uint(NOTIFY, &mut out);
                encode_str(method, &mut out);
                out.extend_from_slice(arg);
                out
            }
            Envelope::Reply {
                seq_id,
                error,
                result,
            } => {
                let mut out = Vec::with_capacity(
                    error.as_deref().map_or(1, str::len) + result.len() + 16,
                );
                out.push(0x94);
                encode_uint(REPLY, &mut out);
                encode_uint(*seq_id, &mut out);
                match error {
                    Some(msg) => encode_str(msg, &mut out),
                    None => out.push(0xc0), // nil
                }
                out.extend_from_slice(result);
                out
            }
        }
    }

    /// Decode a frame payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a non-array payload, unknown tag,
    /// wrong arity, or a reply error field that is neither nil nor a
    /// string.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let mut cur = Cursor::new(payload);

        let arity = cur.read_array_len()?;
        let tag = cur.read_uint("envelope tag")?;

        match tag {
            INVOKE => {
                if arity != 4 {
                    return Err(bad_arity("invoke", 4, arity));
                }
                let seq_id = cur.read_uint("seq id")?;
                let method = cur.read_str("method")?;
                let arg = cur.rest(payload)?;
                Ok(Envelope::Invoke {
                    seq_id,
                    method,
                    arg,
                })
            }
            REPLY => {
                if arity != 4 {
                    return Err(bad_arity("reply", 4, arity));
                }
                let seq_id = cur.read_uint("seq id")?;
                let error = cur.read_error_field()?;
                let result = cur.rest(payload)?;
                Ok(Envelope::Reply {
                    seq_id,
                    error,
                    result,
                })
            }
            NOTIFY => {
                if arity != 3 {
                    return Err(bad_arity("notify", 3, arity));
                }
                let method = cur.read_str("method")?;
                let arg = cur.rest(payload)?;
                Ok(Envelope::Notify { method, arg })
            }
            other => Err(WirecallError::Protocol(format!(
                "unknown envelope tag: {}",
                other
            ))),
        }
    }
}

fn bad_arity(kind: &str, want: u64, got: u64) -> WirecallError {
    WirecallError::Protocol(format!(
        "{} envelope must have {} elements, got {}",
        kind, want, got
    ))
}

/// Encode a string with minimal-width MsgPack str markers.
fn encode_str(s: &str, out: &mut Vec<u8>) {
    let len = s.len();
    if len <= 31 {
        out.push(0xa0 | len as u8);
    } else if len <= 0xff {
        out.push(0xd9);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(0xda);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0xdb);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(s.as_bytes());
}

/// Minimal MsgPack reader over an envelope's fixed prefix.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(WirecallError::Protocol(format!(
                "truncated envelope while reading {}",
                what
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array_len(&mut self) -> Result<u64> {
        let marker = self.take(1, "array header")?[0];
        match marker {
            0x90..=0x9f => Ok(u64::from(marker & 0x0f)),
            0xdc => {
                let b = self.take(2, "array16 length")?;
                Ok(u64::from(u16::from_be_bytes([b[0], b[1]])))
            }
            0xdd => {
                let b = self.take(4, "array32 length")?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            other => Err(WirecallError::Protocol(format!(
                "envelope is not an array (marker 0x{:02x})",
                other
            ))),
        }
    }

    fn read_uint(&mut self, what: &str) -> Result<u64> {
        let marker = self.take(1, what)?[0];
        match marker {
            0x00..=0x7f => Ok(u64::from(marker)),
            0xcc => Ok(u64::from(self.take(1, what)?[0])),
            0xcd => {
                let b = self.take(2, what)?;
                Ok(u64::from(u16::from_be_bytes([b[0], b[1]])))
            }
            0xce => {
                let b = self.take(4, what)?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            0xcf => {
                let b = self.take(8, what)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_be_bytes(raw))
            }
            other => Err(WirecallError::Protocol(format!(
                "expected uint for {}, got marker 0x{:02x}",
                what, other
            ))),
        }
    }

    fn read_str(&mut self, what: &str) -> Result<String> {
        let marker = self.take(1, what)?[0];
        let len = match marker {
            0xa0..=0xbf => usize::from(marker & 0x1f),
            0xd9 => usize::from(self.take(1, what)?[0]),
            0xda => {
                let b = self.take(2, what)?;
                usize::from(u16::from_be_bytes([b[0], b[1]]))
            }
            0xdb => {
                let b = self.take(4, what)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            other => {
                return Err(WirecallError::Protocol(format!(
                    "expected string for {}, got marker 0x{:02x}",
                    what, other
                )))
            }
        };
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WirecallError::Protocol(format!("{} is not valid UTF-8", what)))
    }

    /// Reply error field: nil or a string, nothing else.
    fn read_error_field(&mut self) -> Result<Option<String>> {
        if self.pos >= self.buf.len() {
            return Err(WirecallError::Protocol(
                "truncated envelope while reading error field".to_string(),
            ));
        }
        if self.buf[self.pos] == 0xc0 {
            self.pos += 1;
            return Ok(None);
        }
        self.read_str("error field").map(Some)
    }

    /// Everything after the fixed prefix, as a slice of the original
    /// payload (zero-copy). An envelope's last element must be present.
    fn rest(&self, payload: &Bytes) -> Result<Bytes> {
        if self.pos >= payload.len() {
            return Err(WirecallError::Protocol(
                "envelope is missing its payload element".to_string(),
            ));
        }
        Ok(payload.slice(self.pos..))
    }
}
