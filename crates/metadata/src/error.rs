//! Errors raised by the metadata index.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A session was asked to move between states it cannot connect.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A stored row could not be decoded back into its domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("sqlite: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json column: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Check whether a database error is a UNIQUE constraint failure on `table`.
///
/// SQLite reports these either with column names
/// (`UNIQUE constraint failed: t.a, t.b`) or with the index name, so both
/// forms are matched on the table name.
pub(crate) fn is_unique_violation(err: &sqlx::Error, table: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message();
            msg.contains("UNIQUE constraint") && msg.contains(table)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transition_message() {
        let err = MetadataError::InvalidStateTransition {
            from: "completed".to_string(),
            to: "finishing".to_string(),
        };
        assert_eq!(err.to_string(), "invalid state transition: completed -> finishing");
    }

    #[test]
    fn test_non_database_error_is_not_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound, "upload_sessions"));
    }
}
