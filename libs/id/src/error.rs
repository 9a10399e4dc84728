//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The string is not a UUID.
    #[error("invalid {kind} '{value}': {message}")]
    InvalidUuid {
        kind: &'static str,
        value: String,
        message: String,
    },

    /// The nil UUID is reserved and never names a resource.
    #[error("{kind} cannot be the nil UUID")]
    Nil { kind: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
