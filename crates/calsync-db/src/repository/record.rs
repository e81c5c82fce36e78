//! # Generic Sync Repository
//!
//! Storage operations shared by every synchronized table. Events and
//! calendars differ only in their columns, so the sync bookkeeping (insert,
//! update, tombstones, sync flags, purge) is written once against the
//! [`Record`] trait.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  insert / update / modify                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BEGIN                                                                  │
//! │    1. Record::before_write   (e.g. demote other primary calendars)      │
//! │    2. INSERT / UPDATE row                                               │
//! │  COMMIT ← constraint failure rolls back step 1 as well                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ChangeFeed::publish   (after commit only)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! Stored as INTEGER epoch milliseconds. `soft_delete` computes the new
//! revision inside SQL as `MAX(now, updated_at + 1)` so it is strictly
//! increasing without a read-modify-write round trip.

use std::marker::PhantomData;

use calsync_core::{clock, CoreError, SyncEntity};
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use crate::error::{DbError, DbResult};
use crate::notify::{ChangeFeed, ChangeKind, Table};

/// A bound SQLite statement.
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

// =============================================================================
// Record Trait
// =============================================================================

/// Mapping between a [`SyncEntity`] and its table.
///
/// `COLUMNS` lists every column in bind order and must start with `id`;
/// [`Record::bind_columns`] binds values in exactly that order.
pub trait Record: SyncEntity {
    const TABLE: Table;

    const COLUMNS: &'static [&'static str];

    /// Binds every column value, in `COLUMNS` order.
    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;

    fn from_row(row: &SqliteRow) -> DbResult<Self>;

    /// Statement run inside the write transaction before the row itself is
    /// written, bound with `?1 = id` and `?2 = now` (epoch millis).
    fn before_write(&self) -> Option<&'static str> {
        None
    }
}

/// Reads an epoch-millis column back into a timestamp.
pub(crate) fn millis_column(row: &SqliteRow, table: &str, column: &str) -> DbResult<DateTime<Utc>> {
    let value: i64 = row.try_get(column)?;
    clock::from_millis(value)
        .ok_or_else(|| DbError::decode(table, format!("{} out of range: {}", column, value)))
}

/// `%term%` with LIKE wildcards escaped (use with `ESCAPE '\'`).
pub(crate) fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn column_list<T: Record>() -> String {
    T::COLUMNS.join(", ")
}

fn insert_sql<T: Record>() -> String {
    let placeholders: Vec<String> = (1..=T::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        T::TABLE.name(),
        column_list::<T>(),
        placeholders.join(", ")
    )
}

fn update_sql<T: Record>() -> String {
    let assignments: Vec<String> = T::COLUMNS
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, column)| format!("{} = ?{}", column, i + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE id = ?1",
        T::TABLE.name(),
        assignments.join(", ")
    )
}

/// Names the offending value of a unique violation on `entity`.
fn constraint_context<T: Record>(err: DbError, entity: &T) -> DbError {
    err.with_value(|field| {
        if field.ends_with("sync_id") {
            entity.sync_id().map(str::to_string)
        } else if field.ends_with(".id") {
            Some(entity.id().to_string())
        } else {
            None
        }
    })
}

// =============================================================================
// Repository
// =============================================================================

/// Sync-aware repository for one record type.
///
/// ## Example
/// ```rust,ignore
/// let events = db.events();
/// events.insert(&standup).await?;
/// events.modify(&standup.meta.id, |e| e.title = "Standup v2".into()).await?;
/// events.soft_delete(&standup.meta.id).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SyncRepository<T: Record> {
    pub(crate) pool: SqlitePool,
    pub(crate) changes: ChangeFeed,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> SyncRepository<T> {
    pub fn new(pool: SqlitePool, changes: ChangeFeed) -> Self {
        SyncRepository {
            pool,
            changes,
            _record: PhantomData,
        }
    }

    /// `SELECT <all columns> FROM <table> <tail>`
    pub(crate) fn select(tail: &str) -> String {
        format!("SELECT {} FROM {} {}", column_list::<T>(), T::TABLE.name(), tail)
    }

    pub(crate) async fn fetch_all(&self, query: SqliteQuery<'_>) -> DbResult<Vec<T>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(T::from_row).collect()
    }

    pub(crate) async fn fetch_optional(&self, query: SqliteQuery<'_>) -> DbResult<Option<T>> {
        query
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(T::from_row)
            .transpose()
    }

    fn not_found(id: &str) -> DbError {
        DbError::not_found(T::KIND.to_string(), id)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Runs [`Record::before_write`], returning how many other rows it touched.
    async fn run_before_write(conn: &mut SqliteConnection, entity: &T) -> DbResult<u64> {
        let Some(sql) = entity.before_write() else {
            return Ok(0);
        };
        let result = sqlx::query(sql)
            .bind(entity.id())
            .bind(clock::now().timestamp_millis())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_in(conn: &mut SqliteConnection, entity: &T) -> DbResult<u64> {
        let side_effects = Self::run_before_write(conn, entity).await?;
        let sql = insert_sql::<T>();
        entity
            .bind_columns(sqlx::query(&sql))
            .execute(&mut *conn)
            .await
            .map_err(|e| constraint_context(DbError::from(e), entity))?;
        Ok(side_effects)
    }

    async fn update_in(conn: &mut SqliteConnection, entity: &T) -> DbResult<u64> {
        let side_effects = Self::run_before_write(conn, entity).await?;
        let sql = update_sql::<T>();
        let result = entity
            .bind_columns(sqlx::query(&sql))
            .execute(&mut *conn)
            .await
            .map_err(|e| constraint_context(DbError::from(e), entity))?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(entity.id()));
        }
        Ok(side_effects)
    }

    /// Inserts a new record exactly as given.
    ///
    /// ## Errors
    /// - [`DbError::ConstraintViolation`] if the `id` (or a non-null
    ///   `sync_id`) already exists
    #[instrument(skip(self, entity), fields(kind = %T::KIND, id = %entity.id()))]
    pub async fn insert(&self, entity: &T) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let side_effects = Self::insert_in(&mut tx, entity).await?;
        tx.commit().await?;

        debug!("Record inserted");
        self.changes.publish(T::TABLE, ChangeKind::Insert, 1 + side_effects);
        Ok(())
    }

    /// Inserts all records in one transaction. Either all are stored or none.
    pub async fn insert_batch(&self, entities: &[T]) -> DbResult<usize> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut side_effects = 0;
        for entity in entities {
            side_effects += Self::insert_in(&mut tx, entity).await?;
        }
        tx.commit().await?;

        debug!(kind = %T::KIND, count = entities.len(), "Batch inserted");
        self.changes.publish(
            T::TABLE,
            ChangeKind::Insert,
            entities.len() as u64 + side_effects,
        );
        Ok(entities.len())
    }

    /// Replaces every column of the row with the same `id`.
    ///
    /// Writes the record verbatim, flags included; callers decide what
    /// `updated_at` and `is_synced` should be. User edits go through
    /// [`SyncRepository::modify`].
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if no row has this `id`
    #[instrument(skip(self, entity), fields(kind = %T::KIND, id = %entity.id()))]
    pub async fn update(&self, entity: &T) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let side_effects = Self::update_in(&mut tx, entity).await?;
        tx.commit().await?;

        self.changes.publish(T::TABLE, ChangeKind::Update, 1 + side_effects);
        Ok(())
    }

    /// Applies a user edit.
    ///
    /// Loads the live row, lets `edit` change content fields, validates the
    /// result, bumps `updated_at` and clears `is_synced`, all in one
    /// transaction. Returns the stored record.
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if no row has this `id`
    /// - [`DbError::Rejected`] if the row is a tombstone or the edit fails validation
    pub async fn modify<F>(&self, id: &str, edit: F) -> DbResult<T>
    where
        F: FnOnce(&mut T),
    {
        let mut tx = self.pool.begin().await?;

        let sql = Self::select("WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Self::not_found(id))?;
        let mut entity = T::from_row(&row)?;

        let meta_before = entity.meta().clone();
        edit(&mut entity);
        *entity.meta_mut() = meta_before;

        entity.validate().map_err(CoreError::from)?;
        entity.mark_user_modified()?;

        let side_effects = Self::update_in(&mut tx, &entity).await?;
        tx.commit().await?;

        debug!(kind = %T::KIND, id, "Record modified");
        self.changes.publish(T::TABLE, ChangeKind::Update, 1 + side_effects);
        Ok(entity)
    }

    /// Marks a record deleted without removing the row.
    ///
    /// Sets `is_deleted`, clears `is_synced` and bumps `updated_at`.
    /// Deleting a tombstone again changes nothing.
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if no row has this `id`
    pub async fn soft_delete(&self, id: &str) -> DbResult<()> {
        self.soft_delete_at(id, clock::now()).await
    }

    /// [`SyncRepository::soft_delete`] with an explicit revision floor.
    ///
    /// The stored `updated_at` becomes `max(at, updated_at + 1ms)`.
    pub async fn soft_delete_at(&self, id: &str, at: DateTime<Utc>) -> DbResult<()> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, is_synced = 0, updated_at = MAX(?2, updated_at + 1) \
             WHERE id = ?1 AND is_deleted = 0",
            T::TABLE.name()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            if self.exists(id).await? {
                debug!(kind = %T::KIND, id, "Already deleted");
                return Ok(());
            }
            return Err(Self::not_found(id));
        }

        debug!(kind = %T::KIND, id, "Record soft-deleted");
        self.changes.publish(T::TABLE, ChangeKind::Delete, 1);
        Ok(())
    }

    /// Physically removes tombstones last changed before `cutoff` whose
    /// deletion the remote has confirmed, or that never reached the remote.
    ///
    /// Returns the number of rows removed.
    pub async fn purge_tombstones_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE is_deleted = 1 AND updated_at < ?1 \
             AND (is_synced = 1 OR sync_id IS NULL)",
            T::TABLE.name()
        );
        let purged = sqlx::query(&sql)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if purged > 0 {
            debug!(kind = %T::KIND, purged, %cutoff, "Tombstones purged");
        }
        self.changes.publish(T::TABLE, ChangeKind::Purge, purged);
        Ok(purged)
    }

    /// [`SyncRepository::update`] that only applies while the row still has
    /// revision `observed`. Returns `false` (and writes nothing) otherwise.
    ///
    /// Used to apply pulled remote state without overwriting an edit made
    /// after the row was read.
    pub async fn replace_if_unchanged(&self, entity: &T, observed: DateTime<Utc>) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let side_effects = Self::run_before_write(&mut tx, entity).await?;

        let sql = format!(
            "{} AND updated_at = ?{}",
            update_sql::<T>(),
            T::COLUMNS.len() + 1
        );
        let result = entity
            .bind_columns(sqlx::query(&sql))
            .bind(observed.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| constraint_context(DbError::from(e), entity))?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;

        self.changes.publish(T::TABLE, ChangeKind::Update, 1 + side_effects);
        Ok(true)
    }

    /// Applies a deletion confirmed by the remote: tombstones the row and
    /// marks it synced in one statement, if it still has revision `observed`.
    ///
    /// The stored `updated_at` becomes `max(at, updated_at + 1ms)`.
    pub async fn apply_remote_tombstone(
        &self,
        id: &str,
        observed: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, is_synced = 1, updated_at = MAX(?3, updated_at + 1) \
             WHERE id = ?1 AND updated_at = ?2",
            T::TABLE.name()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(observed.timestamp_millis())
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() > 0;
        self.changes.publish(T::TABLE, ChangeKind::Delete, result.rows_affected());
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Sync flags
    // -------------------------------------------------------------------------

    async fn set_synced_flag(&self, column: &str, key: &str, synced: bool) -> DbResult<()> {
        let sql = format!(
            "UPDATE {} SET is_synced = ?2 WHERE {} = ?1",
            T::TABLE.name(),
            column
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(synced)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(key));
        }
        self.changes
            .publish(T::TABLE, ChangeKind::SyncFlag, result.rows_affected());
        Ok(())
    }

    /// Sets `is_synced` on the row with this local `id`.
    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        self.set_synced_flag("id", id, true).await
    }

    /// Clears `is_synced` on the row with this remote `sync_id`.
    pub async fn mark_unsynced(&self, sync_id: &str) -> DbResult<()> {
        self.set_synced_flag("sync_id", sync_id, false).await
    }

    /// Sets `is_synced` only if the row still has revision `observed`.
    ///
    /// Returns `false` when the row changed since it was read, so a push
    /// acknowledgement never hides an edit made while the request was in
    /// flight.
    pub async fn mark_synced_if_unchanged(
        &self,
        id: &str,
        observed: DateTime<Utc>,
    ) -> DbResult<bool> {
        let sql = format!(
            "UPDATE {} SET is_synced = 1 WHERE id = ?1 AND updated_at = ?2",
            T::TABLE.name()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(observed.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() > 0;
        self.changes
            .publish(T::TABLE, ChangeKind::SyncFlag, result.rows_affected());
        Ok(applied)
    }

    /// Records the remote id assigned on first push. Leaves `is_synced` alone.
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if no row has this `id`
    /// - [`DbError::ConstraintViolation`] if another row already holds `sync_id`
    pub async fn bind_sync_id(&self, id: &str, sync_id: &str) -> DbResult<()> {
        let sql = format!("UPDATE {} SET sync_id = ?2 WHERE id = ?1", T::TABLE.name());
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(sync_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::from(e).with_value(|_| Some(sync_id.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(id));
        }
        self.changes.publish(T::TABLE, ChangeKind::SyncFlag, 1);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Looks up a row by local id, tombstones included.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<T>> {
        let sql = Self::select("WHERE id = ?1");
        self.fetch_optional(sqlx::query(&sql).bind(id)).await
    }

    /// Looks up a row by remote id, tombstones included.
    pub async fn get_by_sync_id(&self, sync_id: &str) -> DbResult<Option<T>> {
        let sql = Self::select("WHERE sync_id = ?1");
        self.fetch_optional(sqlx::query(&sql).bind(sync_id)).await
    }

    /// Every row with pending local changes, tombstones included, oldest
    /// revision first (ties by id).
    pub async fn query_unsynced(&self) -> DbResult<Vec<T>> {
        let sql = Self::select("WHERE is_synced = 0 ORDER BY updated_at ASC, id ASC");
        self.fetch_all(sqlx::query(&sql)).await
    }

    /// Number of rows with pending local changes.
    pub async fn count_unsynced(&self) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE is_synced = 0", T::TABLE.name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Number of tombstones still stored.
    pub async fn count_tombstones(&self) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE is_deleted = 1", T::TABLE.name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn exists(&self, id: &str) -> DbResult<bool> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?1", T::TABLE.name());
        let count: i64 = sqlx::query_scalar(&sql).bind(id).fetch_one(&self.pool).await?;
        Ok(count > 0)
    }
}
