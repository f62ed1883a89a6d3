//! Error types for the Stowage engine.

use crate::DocumentKey;
use thiserror::Error;

/// All possible errors from the Stowage engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentKey),

    #[error("operation on deleted document: {0}")]
    OperationOnDeleted(DocumentKey),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no queued mutation for {0}")]
    NotQueued(DocumentKey),

    #[error("mutation for {0} is already in flight")]
    AlreadyInFlight(DocumentKey),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::DocumentNotFound(DocumentKey::new("clients", "c-1"));
        assert_eq!(err.to_string(), "document not found: clients/c-1");

        let err = Error::InvalidPayload("patch must be an object".into());
        assert_eq!(err.to_string(), "invalid payload: patch must be an object");

        let err = Error::AlreadyInFlight(DocumentKey::new("sessions", "s-9"));
        assert_eq!(err.to_string(), "mutation for sessions/s-9 is already in flight");
    }
}
