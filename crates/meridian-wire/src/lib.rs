//! Binary-preferred, JSON-fallback wire codec (C2).
//!
//! Two encodings share the network: a MessagePack-compatible binary format
//! (the bus's common binary map/array encoding) and UTF-8 JSON text. On
//! receive, [`detect_format`] inspects the leading byte; application code
//! never sees which one was chosen — the adapter just records it per
//! message for diagnostics.

pub mod error;

pub use error::{Result, WireError};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// The wire encoding a frame used, as determined by [`detect_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// MessagePack-compatible binary encoding.
    Binary,
    /// UTF-8 JSON text.
    Json,
}

/// Encodes `value` as a MessagePack-compatible binary frame, preserving
/// field names (as a map, not a positional tuple) so the format is
/// self-describing on the wire.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(WireError::from)
}

/// Encodes `value` as UTF-8 JSON.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(WireError::JsonEncode)
}

/// Encodes `value` using the preferred format, falling back to JSON when
/// `prefer_binary` is false (the `bus.use_binary_codec` configuration flag).
pub fn encode<T: Serialize>(value: &T, prefer_binary: bool) -> Result<Vec<u8>> {
    if prefer_binary {
        encode_binary(value)
    } else {
        encode_json(value)
    }
}

/// Returns whether `frame`'s leading byte matches one of the MessagePack
/// map/array/extended-type headers this codec emits:
/// fixmap `0x80-0x8F`, fixarray `0x90-0x9F`, extended types `0xC0-0xDF`
/// (excluding the two reserved slots), and map16/map32 `0xDE`/`0xDF`.
fn looks_binary(first_byte: u8) -> bool {
    matches!(first_byte, 0x80..=0x8F | 0x90..=0x9F | 0xC0..=0xDF)
}

/// Inspects `frame`'s leading byte to decide which decoder to use.
///
/// Returns [`WireError::EmptyFrame`] for a zero-length frame.
pub fn detect_format(frame: &[u8]) -> Result<Format> {
    let first = *frame.first().ok_or(WireError::EmptyFrame)?;
    if looks_binary(first) {
        Ok(Format::Binary)
    } else {
        Ok(Format::Json)
    }
}

/// Detects `frame`'s format and decodes it, returning the value and the
/// format that was used.
pub fn detect_and_deserialize<T: DeserializeOwned>(frame: &[u8]) -> Result<(T, Format)> {
    match detect_format(frame)? {
        Format::Binary => {
            let value = rmp_serde::from_slice(frame)?;
            Ok((value, Format::Binary))
        }
        Format::Json => {
            let value = serde_json::from_slice(frame).map_err(WireError::JsonDecode)?;
            Ok((value, Format::Json))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(matches!(detect_format(&[]), Err(WireError::EmptyFrame)));
    }

    #[test]
    fn binary_round_trip_detected_as_binary() {
        let sample = Sample {
            a: 7,
            b: "hi".into(),
        };
        let frame = encode_binary(&sample).unwrap();
        let (decoded, fmt): (Sample, Format) = detect_and_deserialize(&frame).unwrap();
        assert_eq!(decoded, sample);
        assert_eq!(fmt, Format::Binary);
    }

    #[test]
    fn json_round_trip_detected_as_json() {
        let sample = Sample {
            a: 7,
            b: "hi".into(),
        };
        let frame = encode_json(&sample).unwrap();
        assert_eq!(frame[0], b'{');
        let (decoded, fmt): (Sample, Format) = detect_and_deserialize(&frame).unwrap();
        assert_eq!(decoded, sample);
        assert_eq!(fmt, Format::Json);
    }

    #[test]
    fn encode_honors_prefer_binary_flag() {
        let sample = Sample {
            a: 1,
            b: "x".into(),
        };
        let binary = encode(&sample, true).unwrap();
        let json = encode(&sample, false).unwrap();
        assert_eq!(detect_format(&binary).unwrap(), Format::Binary);
        assert_eq!(detect_format(&json).unwrap(), Format::Json);
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_struct_round_trips_binary(a in any::<u32>(), b in ".*") {
            let sample = Sample { a, b };
            let frame = encode_binary(&sample).unwrap();
            let (decoded, _): (Sample, Format) = detect_and_deserialize(&frame).unwrap();
            prop_assert_eq!(decoded, sample);
        }
    }
}
