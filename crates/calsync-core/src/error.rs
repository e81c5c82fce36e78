//! # Error Types
//!
//! Domain-specific error types for calsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  calsync-core errors (this file)                                       │
//! │  ├── CoreError        - Illegal sync transitions, wrapped validation    │
//! │  └── ValidationError  - Entity construction / edit failures            │
//! │                                                                         │
//! │  calsync-db errors                                                     │
//! │  └── DbError          - ConstraintViolation, NotFound, ...             │
//! │                                                                         │
//! │  calsync-sync errors                                                   │
//! │  └── SyncError        - Transient network failures, conflicts, config  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A sync event was applied to a state that does not accept it.
    ///
    /// ## When This Occurs
    /// - Editing a tombstone (`UserEdit` on `PendingDelete`)
    /// - Acknowledging a push that was never started
    /// - Anything applied to `Purged`
    #[error("Invalid sync transition: {event} is not allowed from {from}")]
    InvalidTransition { from: String, event: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors raised while building or editing entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or blank.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g. a color that is not `#RRGGBB`).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// An event ends before it starts.
    #[error("end must not be before start")]
    EndBeforeStart,
}

impl ValidationError {
    /// Shorthand for [`ValidationError::Required`].
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidTransition {
            from: "purged".into(),
            event: "user_edit".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid sync transition: user_edit is not allowed from purged"
        );

        let err: CoreError = ValidationError::required("title").into();
        assert!(err.to_string().contains("title is required"));
    }
}
