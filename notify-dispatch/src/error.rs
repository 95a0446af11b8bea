//! Crate-wide error types.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Delivery failures are not represented here: a channel reports them as a
/// [`DeliveryResult`](crate::notification::DeliveryResult) value.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another worker won the claim on a row. Callers skip the row.
    #[error("Concurrency conflict on {entity_type} {id}")]
    ConcurrencyConflict { entity_type: String, id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn conflict(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ConcurrencyConflict {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error is a lost claim rather than a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_helper() {
        let err = Error::conflict("Notification", "n-1");
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "Concurrency conflict on Notification n-1");
        assert!(!Error::config("bad").is_conflict());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::invalid_transition("sent", "cancelled");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from sent to cancelled"
        );
    }
}
