//! Payload encoding.
//!
//! Call arguments and reply results cross the wire as MsgPack. Structs
//! are encoded with `to_vec_named` so they travel as maps keyed by field
//! name; the peer on the far side of a connection is not necessarily
//! Rust and cannot be held to a positional struct layout.
//!
//! ```
//! use wirecall::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Arg {
//!     i: i32,
//! }
//!
//! let bytes = MsgPackCodec::encode(&Arg { i: 4 }).unwrap();
//! let back: Arg = MsgPackCodec::decode(&bytes).unwrap();
//! assert_eq!(back, Arg { i: 4 });
//! ```

use crate::error::Result;

/// The single chokepoint for turning values into wire payloads and
/// back. Everything a handler or caller serializes goes through here,
/// so the map-format convention cannot drift between call sites.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value as a MsgPack payload, structs as name-keyed maps.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode a MsgPack payload into a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct FooArg {
        i: i32,
        label: String,
    }

    #[test]
    fn test_struct_round_trip() {
        let arg = FooArg {
            i: 4,
            label: "first".to_string(),
        };
        let bytes = MsgPackCodec::encode(&arg).unwrap();
        let back: FooArg = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(back, arg);
    }

    #[test]
    fn test_structs_encode_as_maps_not_arrays() {
        // A non-Rust peer looks fields up by name, so the payload must
        // lead with a map marker, not a fixarray
        let bytes = MsgPackCodec::encode(&FooArg {
            i: 1,
            label: "x".to_string(),
        })
        .unwrap();
        assert_eq!(
            bytes[0] & 0xf0,
            0x80,
            "struct payload should start with a map marker, got {:#04x}",
            bytes[0]
        );
    }

    #[test]
    fn test_none_encodes_as_nil() {
        // The reply error slot relies on None mapping to msgpack nil
        let bytes = MsgPackCodec::encode(&None::<String>).unwrap();
        assert_eq!(bytes, vec![0xc0]);
        let back: Option<String> = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(back, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<FooArg> = MsgPackCodec::decode(b"not msgpack at all");
        assert!(result.is_err());
    }
}
