//! Wire codec errors (§7 "Serialization errors").

use thiserror::Error;

/// Errors raised while encoding or decoding a wire frame.
#[derive(Error, Debug)]
pub enum WireError {
    /// The frame contained zero bytes.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame's leading byte did not match a known binary header and the
    /// JSON fallback also failed to parse.
    #[error("could not detect a wire format for this frame")]
    UnknownFormat,

    /// Binary (MessagePack-compatible) decoding failed.
    #[error("binary decode failed: {0}")]
    BinaryDecode(#[from] rmp_serde::decode::Error),

    /// Binary encoding failed.
    #[error("binary encode failed: {0}")]
    BinaryEncode(#[from] rmp_serde::encode::Error),

    /// JSON decoding failed.
    #[error("json decode failed: {0}")]
    JsonDecode(serde_json::Error),

    /// JSON encoding failed.
    #[error("json encode failed: {0}")]
    JsonEncode(serde_json::Error),
}

/// Convenience alias for results bounded by [`WireError`].
pub type Result<T> = std::result::Result<T, WireError>;
