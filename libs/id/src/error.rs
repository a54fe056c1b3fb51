//! Error types for id parsing.

use thiserror::Error;

/// Errors that can occur when parsing an id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    #[error("invalid id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("id missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the input had the wrong resource prefix.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
