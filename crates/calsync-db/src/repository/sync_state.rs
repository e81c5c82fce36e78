//! # Sync State Repository
//!
//! Durable bookkeeping for the reconciliation engine:
//!
//! - `sync_cursor`: the opaque change-feed position last returned by the
//!   remote, so a restart resumes the pull where it stopped
//! - `sync_failures`: per-record consecutive failure counts, so records that
//!   keep failing can be reported without blocking the rest

use calsync_core::{clock, EntityKind};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::record::millis_column;

/// Scope used when only one remote is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// A record that failed to sync at least once since its last success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: EntityKind,
    pub entity_id: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl FailureRecord {
    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        let kind: String = row.try_get("entity_kind")?;
        let kind = match kind.as_str() {
            "event" => EntityKind::Event,
            "calendar" => EntityKind::Calendar,
            other => {
                return Err(DbError::decode(
                    "sync_failures",
                    format!("unknown entity kind '{}'", other),
                ))
            }
        };

        Ok(FailureRecord {
            kind,
            entity_id: row.try_get("entity_id")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            first_failed_at: millis_column(row, "sync_failures", "first_failed_at")?,
            last_failed_at: millis_column(row, "sync_failures", "last_failed_at")?,
        })
    }
}

/// Repository for the remote cursor and failure counts.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Cursor
    // -------------------------------------------------------------------------

    /// Last stored cursor for `scope`, `None` before the first full pull.
    pub async fn get_cursor(&self, scope: &str) -> DbResult<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM sync_cursor WHERE scope = ?1")
                .bind(scope)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    pub async fn save_cursor(&self, scope: &str, cursor: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO sync_cursor (scope, cursor, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(scope) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(cursor)
        .bind(clock::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(scope, cursor, "Cursor saved");
        Ok(())
    }

    /// Forgets the cursor; the next pull starts from the beginning.
    pub async fn clear_cursor(&self, scope: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_cursor WHERE scope = ?1")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------------

    /// Counts one more failure for a record and returns the new total.
    pub async fn record_failure(&self, kind: EntityKind, entity_id: &str, error: &str) -> DbResult<i64> {
        let now = clock::now().timestamp_millis();
        let attempts: i64 = sqlx::query_scalar(
            "INSERT INTO sync_failures \
                (entity_kind, entity_id, attempts, last_error, first_failed_at, last_failed_at) \
             VALUES (?1, ?2, 1, ?3, ?4, ?4) \
             ON CONFLICT(entity_kind, entity_id) DO UPDATE SET \
                attempts = attempts + 1, \
                last_error = excluded.last_error, \
                last_failed_at = excluded.last_failed_at \
             RETURNING attempts",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(error)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Forgets the failures of a record after it synced.
    pub async fn clear_failure(&self, kind: EntityKind, entity_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_failures WHERE entity_kind = ?1 AND entity_id = ?2")
            .bind(kind.as_str())
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records with at least `min_attempts` consecutive failures, worst first.
    pub async fn failures_at_least(&self, min_attempts: i64) -> DbResult<Vec<FailureRecord>> {
        let rows = sqlx::query(
            "SELECT entity_kind, entity_id, attempts, last_error, first_failed_at, last_failed_at \
             FROM sync_failures WHERE attempts >= ?1 \
             ORDER BY attempts DESC, entity_kind ASC, entity_id ASC",
        )
        .bind(min_attempts)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(FailureRecord::from_row).collect()
    }

    pub async fn failure_count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Drops failure rows whose record no longer exists (purged).
    pub async fn prune_failures(&self) -> DbResult<u64> {
        let pruned = sqlx::query(
            "DELETE FROM sync_failures WHERE \
                (entity_kind = 'event' AND entity_id NOT IN (SELECT id FROM events)) \
             OR (entity_kind = 'calendar' AND entity_id NOT IN (SELECT id FROM calendars))",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use calsync_core::{Calendar, CalendarType, SyncEntity};

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let state = db.sync_state();

        assert_eq!(state.get_cursor(DEFAULT_SCOPE).await.unwrap(), None);

        state.save_cursor(DEFAULT_SCOPE, "12").await.unwrap();
        state.save_cursor(DEFAULT_SCOPE, "40").await.unwrap();
        assert_eq!(
            state.get_cursor(DEFAULT_SCOPE).await.unwrap().as_deref(),
            Some("40")
        );
        assert_eq!(state.get_cursor("other").await.unwrap(), None);

        state.clear_cursor(DEFAULT_SCOPE).await.unwrap();
        assert_eq!(state.get_cursor(DEFAULT_SCOPE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_counting() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let state = db.sync_state();
        let cal = Calendar::with_default_color("Work", CalendarType::Local).unwrap();
        db.calendars().insert(&cal).await.unwrap();

        assert_eq!(state.record_failure(EntityKind::Calendar, cal.id(), "offline").await.unwrap(), 1);
        assert_eq!(state.record_failure(EntityKind::Calendar, cal.id(), "timeout").await.unwrap(), 2);
        assert_eq!(state.record_failure(EntityKind::Event, "gone", "timeout").await.unwrap(), 1);

        let worst = state.failures_at_least(2).await.unwrap();
        assert_eq!(worst.len(), 1);
        assert_eq!(worst[0].kind, EntityKind::Calendar);
        assert_eq!(worst[0].last_error.as_deref(), Some("timeout"));
        assert!(worst[0].last_failed_at >= worst[0].first_failed_at);

        // "gone" has no row in events
        assert_eq!(state.prune_failures().await.unwrap(), 1);

        state.clear_failure(EntityKind::Calendar, cal.id()).await.unwrap();
        assert_eq!(state.failure_count().await.unwrap(), 0);
    }
}
