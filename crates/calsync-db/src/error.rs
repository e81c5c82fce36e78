//! # Database Error Types
//!
//! Error types for local store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← ConstraintViolation / NotFound / ...          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (calsync-sync) ← per-record failure, record stays unsynced  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use calsync_core::{CoreError, ValidationError};
use thiserror::Error;

/// Local store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// No row with the given id (or sync id).
    ///
    /// ## When This Occurs
    /// - `update` / `soft_delete` / `mark_synced` on an id that was never inserted
    /// - the row was purged by the retention sweep
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Inserting an `id` that already exists
    /// - Binding a `sync_id` that another row of the same type already holds
    /// - Promoting a second primary calendar outside `set_primary_calendar`
    #[error("Constraint violation on {field}: '{value}'")]
    ConstraintViolation { field: String, value: String },

    /// A stored value could not be turned back into a domain value.
    #[error("Corrupt row in {table}: {reason}")]
    Decode { table: String, reason: String },

    /// The requested change breaks a domain rule (e.g. editing a tombstone).
    #[error(transparent)]
    Rejected(#[from] CoreError),

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a ConstraintViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::ConstraintViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    pub(crate) fn decode(table: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Decode {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Fills in the offending value of a constraint violation.
    ///
    /// SQLite only reports the column; callers know the value.
    pub(crate) fn with_value(self, pick: impl FnOnce(&str) -> Option<String>) -> Self {
        match self {
            DbError::ConstraintViolation { field, value } => {
                let value = pick(&field).unwrap_or(value);
                DbError::ConstraintViolation { field, value }
            }
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DbError::ConstraintViolation { .. })
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::ConstraintViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("constraint failed") {
                    DbError::ConstraintViolation {
                        field: msg.to_string(),
                        value: "unknown".to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode("unknown", format!("column {}: {}", index, source))
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Rejected(CoreError::Validation(err))
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_value_fills_constraint_only() {
        let err = DbError::duplicate("events.id", "unknown")
            .with_value(|field| field.ends_with(".id").then(|| "abc".to_string()));
        assert!(matches!(
            err,
            DbError::ConstraintViolation { ref value, .. } if value == "abc"
        ));

        let err = DbError::not_found("Event", "x").with_value(|_| Some("ignored".into()));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validation_converts_to_rejected() {
        let err: DbError = ValidationError::required("title").into();
        assert!(err.to_string().contains("title is required"));
    }
}
