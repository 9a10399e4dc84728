//! Error types for notification construction.

use thiserror::Error;

/// Errors that can occur when building notifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A required envelope field was never set.
    #[error("notification is missing required field '{0}'")]
    MissingField(&'static str),

    /// The event type is not of the `service.method` form.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
