//! Length-prefixed frame extraction.
//!
//! Each frame on the wire is a MsgPack-encoded unsigned integer (the
//! payload length) followed by that many payload bytes. The first byte of
//! the length tells us its width, so framing never needs a full MsgPack
//! decoder:
//!
//! - `0x00..=0x7f` positive fixint, 1 byte total
//! - `0xcc` uint8, 2 bytes total
//! - `0xcd` uint16, 3 bytes total
//! - `0xce` uint32, 5 bytes total
//!
//! Anything else in header position is a protocol error. A state machine
//! mirrors partial reads: wait for the header, then wait for the payload.

use bytes::Bytes;

use super::ring::ByteRing;
use crate::error::{Result, WirecallError};

/// Default maximum payload size: 1GB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024 * 1024;

/// Number of bytes a frame header occupies, judged from its first byte.
///
/// Returns `None` for markers that cannot begin a frame (the peer is not
/// speaking this protocol).
pub fn header_width(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7f => Some(1),
        0xcc => Some(2),
        0xcd => Some(3),
        0xce => Some(5),
        _ => None,
    }
}

/// Decode a frame-header uint whose width was established by
/// [`header_width`]. `buf` must hold exactly that many bytes.
fn decode_header(buf: &[u8]) -> u64 {
    match buf[0] {
        0xcc => u64::from(buf[1]),
        0xcd => u64::from(u16::from_be_bytes([buf[1], buf[2]])),
        0xce => u64::from(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]])),
        b => u64::from(b),
    }
}

/// Encode an unsigned integer as minimal-width MsgPack bytes.
///
/// Used for outbound frame headers and for seq ids inside envelopes.
pub fn encode_uint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0x7f => out.push(value as u8),
        0x80..=0xff => {
            out.push(0xcc);
            out.push(value as u8);
        }
        0x100..=0xffff => {
            out.push(0xcd);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xce);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xcf);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Build a complete outbound frame: length header followed by payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    encode_uint(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the length header's bytes.
    AwaitingHeader,
    /// Header parsed, waiting for `expected` payload bytes.
    AwaitingPayload { expected: usize },
}

/// Accumulates incoming chunks and extracts complete frame payloads.
///
/// Protocol errors (bad header marker, oversized payload) are
/// unrecoverable for the stream: the packetizer resets itself and the
/// error propagates so the transport can tear the connection down.
pub struct Packetizer {
    ring: ByteRing,
    state: State,
    max_payload: usize,
}

impl Packetizer {
    /// Create a packetizer with the default payload cap.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a packetizer with a custom payload cap.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            ring: ByteRing::new(),
            state: State::AwaitingHeader,
            max_payload,
        }
    }

    /// Feed a chunk of stream bytes; returns all frame payloads completed
    /// by it, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a bad header marker or a payload
    /// exceeding the cap. The packetizer resets itself first.
    pub fn feed(&mut self, chunk: Bytes) -> Result<Vec<Bytes>> {
        self.ring.append(chunk);

        let mut frames = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(payload)) => frames.push(payload),
                Ok(None) => break,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }

    /// Drop all buffered bytes and return to the header state.
    ///
    /// Called on protocol errors and on connection teardown so a
    /// reconnected stream starts from a frame boundary.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.state = State::AwaitingHeader;
    }

    /// Number of buffered, not-yet-framed bytes.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::AwaitingHeader => {
                let first = match self.ring.peek(1) {
                    Some(b) => b[0],
                    None => return Ok(None),
                };

                let width = header_width(first).ok_or_else(|| {
                    WirecallError::Protocol(format!("bad frame header byte: 0x{:02x}", first))
                })?;

                let header = match self.ring.peek(width) {
                    Some(h) => h,
                    None => return Ok(None),
                };
                let expected = decode_header(&header) as usize;

                if expected > self.max_payload {
                    return Err(WirecallError::Protocol(format!(
                        "payload size {} exceeds maximum {}",
                        expected, self.max_payload
                    )));
                }

                self.ring.consume(width);
                self.state = State::AwaitingPayload { expected };
                self.try_extract_one()
            }

            State::AwaitingPayload { expected } => {
                let payload = match self.ring.peek(expected) {
                    Some(p) => p,
                    None => return Ok(None),
                };
                self.ring.consume(expected);
                self.state = State::AwaitingHeader;
                Ok(Some(payload))
            }
        }
    }
}

impl Default for Packetizer {
    fn default() -> Self {
        Self::new()
    }
}
