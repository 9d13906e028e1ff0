//! Crate-level error type.
//!
//! Variants fall into four groups that callers treat differently:
//! input errors are returned to the requester as-is, cancellation errors are
//! retryable at the caller's discretion, aggregation errors are local to one
//! metric (the aggregation skips it and keeps going), and store errors come
//! from the external collaborators.

use std::time::Duration;

/// Everything that can go wrong inside fleetpulse.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --- input errors ---
    /// A look-back period string could not be parsed as a duration.
    #[error("invalid period '{0}': expected a duration such as 1m, 15m or 1h30m")]
    InvalidPeriod(String),

    /// The requested configuration does not exist.
    #[error("configuration '{0}' not found")]
    ConfigurationNotFound(String),

    /// A label selector string could not be parsed.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// A processor attribute did not follow the throughput measurement naming scheme.
    #[error("invalid processor name '{0}'")]
    InvalidProcessorName(String),

    /// The configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // --- back-pressure / cancellation ---
    /// The caller's cancellation token fired before the operation completed.
    #[error("operation cancelled before completion")]
    Cancelled,

    /// The batching pipeline is shutting down or already stopped.
    #[error("measurement pipeline is stopped")]
    PipelineStopped,

    // --- aggregation edge cases ---
    /// Rate inputs were not in chronological order.
    #[error("rate samples out of order: first sample is {ahead:?} after the last")]
    NonChronological { ahead: Duration },

    /// The time span a rate would be computed over is zero or negative.
    #[error("rate duration must be positive")]
    NonPositiveDuration,

    /// A metric value is not a usable scalar.
    #[error("metric '{name}' has an unsupported value type")]
    UnsupportedValue { name: String },

    /// A metric is missing an attribute required for aggregation.
    #[error("metric '{name}' is missing attribute '{attribute}'")]
    MissingAttribute { name: String, attribute: String },

    // --- collaborators ---
    /// A resource or measurement store call failed.
    #[error("store error: {0}")]
    Store(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
