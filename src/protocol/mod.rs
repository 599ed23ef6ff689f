//! Wire protocol: framing and message envelopes.
//!
//! Bytes arrive from a stream in arbitrary chunks. The [`ByteRing`]
//! accumulates them, the [`Packetizer`] cuts them into length-prefixed
//! frames, and [`Envelope`] gives each frame payload its meaning.

mod envelope;
mod packetizer;
mod ring;

pub use envelope::{Envelope, INVOKE, NOTIFY, REPLY};
pub use packetizer::{encode_uint, frame, header_width, Packetizer, DEFAULT_MAX_PAYLOAD};
pub use ring::ByteRing;
