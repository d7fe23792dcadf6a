//! Error taxonomy for the CARSS operations core.
//!
//! Lower layers convert raw transport / SQLite failures into these typed
//! variants so callers can branch on the class of failure instead of
//! string-matching. UI-facing layers translate them into user notifications.

use thiserror::Error;

/// All failure classes surfaced by the core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input rejected before any write was attempted (missing payment
    /// method, missing POS receipt reference, no active shift, ...).
    #[error("validation: {0}")]
    Validation(String),

    /// The entity was already in a terminal state when the operation ran:
    /// intent already confirmed/voided, order already served, etc. Callers
    /// show a non-alarming "already processed" message for these.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    /// Caller's role is not in the allow-list for a privileged action.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Network / 5xx / timeout class. Recoverable by queueing or retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Missing or invalid backend credentials. Not retried automatically.
    #[error("configuration: {0}")]
    Config(String),

    /// Remote response did not match the expected entity shape.
    #[error("decode: {0}")]
    Decode(String),

    /// Local store failure (SQLite error, poisoned lock).
    #[error("database: {0}")]
    Db(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Db(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Decode(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_error_maps_to_db() {
        let err: CoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CoreError::Db(_)));
    }

    #[test]
    fn test_display_includes_class() {
        let err = CoreError::Validation("POS Receipt ID is required".into());
        assert_eq!(err.to_string(), "validation: POS Receipt ID is required");
    }
}
