//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding or validating events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The job state string is not recognized.
    #[error("unknown job state: {0}")]
    UnknownState(String),

    /// The state is valid but cannot appear in a published job event.
    #[error("job state '{0}' is not published")]
    UnpublishedState(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

impl From<convoy_id::IdError> for EventError {
    fn from(err: convoy_id::IdError) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
