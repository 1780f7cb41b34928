//! Bus and messaging-fabric errors.

use thiserror::Error;

/// Errors raised by [`crate::MessageBus`] adapters and [`crate::fabric::MessagingFabric`].
#[derive(Error, Debug)]
pub enum BusError {
    /// An operation was attempted before [`crate::MessageBus::connect`] succeeded.
    #[error("bus not connected")]
    NotConnected,

    /// Every configured connection is dead and none could be selected.
    #[error("all bus connections are dead")]
    AllConnectionsDead,

    /// A `request` or tracked command exceeded its timeout with no reply.
    #[error("timed out waiting for a reply on '{subject}'")]
    Timeout { subject: String },

    /// `jetstream_subscribe` was asked for both `queue` and `durable`, which
    /// the bus's consumer model treats as conflicting.
    #[error("queue and durable are mutually exclusive for subject '{subject}'")]
    ConflictingQueueAndDurable { subject: String },

    /// A codec failure while encoding/decoding a message.
    #[error("wire codec error: {0}")]
    Codec(#[from] meridian_wire::WireError),

    /// A backend (NATS client, stream/consumer) rejected an operation.
    #[error("bus backend error during {operation}: {message}")]
    Backend { operation: &'static str, message: String },
}

/// Convenience alias for results bounded by [`BusError`].
pub type Result<T> = std::result::Result<T, BusError>;
