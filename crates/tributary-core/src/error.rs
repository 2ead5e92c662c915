//! Error types for the tributary event model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or interpreting events.
#[derive(Error, Debug)]
pub enum Error {
    /// Payload bytes are not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed as JSON but the top-level value is not an object.
    #[error("payload is not a JSON object (found {found})")]
    NotAnObject {
        /// JSON type that was found instead.
        found: &'static str,
    },

    /// A route specification could not be parsed or conflicts with another.
    #[error("invalid route '{spec}': {reason}")]
    InvalidRoute {
        /// The offending route specification.
        spec: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
