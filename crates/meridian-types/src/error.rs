//! Validation errors for domain value objects and messages.

use thiserror::Error;

/// Errors raised when constructing or parsing a domain value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A service name failed the `[a-z][a-z0-9_-]*` (no trailing `-`/`_`) rule.
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    /// An instance id was empty or contained whitespace/control characters.
    #[error("invalid instance id '{0}'")]
    InvalidInstanceId(String),

    /// A method name failed the lowercase snake_case rule.
    #[error("invalid method name '{0}'")]
    InvalidMethodName(String),

    /// An event type failed the dot-segmented naming rule.
    #[error("invalid event type '{0}'")]
    InvalidEventType(String),

    /// A subject pattern (possibly wildcarded) failed validation.
    #[error("invalid subject pattern '{0}'")]
    InvalidPattern(String),

    /// A priority string was not one of `low|normal|high|critical`.
    #[error("invalid priority '{0}'")]
    InvalidPriority(String),

    /// A semantic version string failed the `MAJOR.MINOR[.PATCH]` rule.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// A numeric field fell outside its documented range.
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// `create_only` and `update_only` were both set on the same write.
    #[error("create_only and update_only are mutually exclusive")]
    ExclusiveOptionsConflict,

    /// A watch call specified both `key` and `prefix`.
    #[error("watch() accepts either a key or a prefix, not both")]
    WatchKeyAndPrefix,

    /// An `RPCResponse` violated the `success ⇔ error is absent` invariant.
    #[error("success must be consistent with the presence of an error")]
    InconsistentResult,
}

/// Convenience alias for results bounded by [`ValidationError`].
pub type Result<T> = std::result::Result<T, ValidationError>;
