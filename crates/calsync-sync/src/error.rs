//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Reconciliation      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  TransientNet.. │  │  CycleInProgress        │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │  CalendarNotSynced      │ │
//! │  │  ConfigLoad/Save│  │  RemoteConflict │  │  InvalidTransition      │ │
//! │  └─────────────────┘  │  InvalidCursor  │  └─────────────────────────┘ │
//! │                       └─────────────────┘                              │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │  Serialization  │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Database(Db..) │  │  Serialization  │  │  ShuttingDown, Disabled │ │
//! │  │                 │  │  Failed         │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use calsync_core::{CoreError, EntityKind};
use calsync_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote could not be reached or answered with a temporary error.
    #[error("Remote unavailable: {0}")]
    TransientNetworkFailure(String),

    /// A remote call did not finish within the request timeout.
    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    /// The remote holds a newer revision than the one pushed.
    #[error("Remote conflict for {kind}/{sync_id}: remote revision is newer")]
    RemoteConflict { kind: EntityKind, sync_id: String },

    /// The remote did not understand the change-feed cursor.
    #[error("Invalid change cursor: {0}")]
    InvalidCursor(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// A cycle is already running; this call did nothing.
    #[error("A sync cycle is already in progress")]
    CycleInProgress,

    /// An event cannot be pushed before its calendar has a remote id.
    #[error("Calendar {calendar_id} has not been synced yet")]
    CalendarNotSynced { calendar_id: String },

    /// A record was in a state that does not allow the sync step.
    #[error(transparent)]
    InvalidTransition(#[from] CoreError),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Local store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Failed to serialize or deserialize a remote document.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync agent error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Sync mode is `offline`; the agent never runs cycles.
    #[error("Sync is disabled (mode = offline)")]
    Disabled,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - Events waiting for their calendar's first push
    /// - Database pool exhaustion / connection failures
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Constraint violations and decode failures
    /// - Conflicts (resolved by the pull phase instead)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientNetworkFailure(_)
            | SyncError::Timeout(_)
            | SyncError::CalendarNotSynced { .. } => true,
            SyncError::Database(db) => matches!(
                db,
                DbError::PoolExhausted | DbError::ConnectionFailed(_)
            ),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::TransientNetworkFailure("offline".into()).is_retryable());
        assert!(SyncError::Timeout(10_000).is_retryable());
        assert!(SyncError::CalendarNotSynced { calendar_id: "c1".into() }.is_retryable());
        assert!(SyncError::Database(DbError::PoolExhausted).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::CycleInProgress.is_retryable());
        assert!(!SyncError::Database(DbError::duplicate("sync_id", "s1")).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::MissingDeviceId.is_config_error());
        assert!(SyncError::ConfigLoadFailed("nope".into()).is_config_error());
        assert!(!SyncError::Timeout(1).is_config_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RemoteConflict {
            kind: EntityKind::Event,
            sync_id: "abc-123".into(),
        };
        assert!(err.to_string().contains("event/abc-123"));
        assert_eq!(SyncError::Timeout(250).to_string(), "Remote call timed out after 250 ms");
    }

    #[test]
    fn test_db_error_keeps_its_kind() {
        let err: SyncError = DbError::not_found("Event", "e1").into();
        assert!(matches!(err, SyncError::Database(ref db) if db.is_not_found()));
    }
}
