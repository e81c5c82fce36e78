//! # Event Repository
//!
//! Event storage plus the read views the calendar UI needs.
//!
//! ## Read Views
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  query_by_date_range(start, end)   start_at in [start, end], live only  │
//! │  query_by_calendar(calendar_id)    one calendar, live only              │
//! │  query_visible_in_range(..)        range ∩ visible calendars            │
//! │  search(term)                      title / description / location       │
//! │  upcoming(from, limit)             next N starting at or after `from`   │
//! │  find_dangling()                   live events whose calendar is gone   │
//! │                                                                         │
//! │  Every list is ordered by start, then id.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use calsync_core::Event;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use tracing::debug;

use crate::error::DbResult;
use crate::notify::{ChangeKind, Table};
use crate::repository::record::{like_pattern, millis_column, Record, SqliteQuery, SyncRepository};

/// Repository for events.
pub type EventRepository = SyncRepository<Event>;

impl Record for Event {
    const TABLE: Table = Table::Events;

    const COLUMNS: &'static [&'static str] = &[
        "id",
        "sync_id",
        "title",
        "description",
        "start_at",
        "end_at",
        "is_all_day",
        "location",
        "color",
        "calendar_id",
        "recurrence_rule",
        "reminder_minutes",
        "created_at",
        "updated_at",
        "is_synced",
        "is_deleted",
    ];

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.meta.id)
            .bind(self.meta.sync_id.as_deref())
            .bind(&self.title)
            .bind(self.description.as_deref())
            .bind(self.start.timestamp_millis())
            .bind(self.end.timestamp_millis())
            .bind(self.is_all_day)
            .bind(self.location.as_deref())
            .bind(&self.color)
            .bind(&self.calendar_id)
            .bind(self.recurrence_rule.as_deref())
            .bind(self.reminder_minutes)
            .bind(self.meta.created_at.timestamp_millis())
            .bind(self.meta.updated_at.timestamp_millis())
            .bind(self.meta.is_synced)
            .bind(self.meta.is_deleted)
    }

    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        Ok(Event {
            meta: calsync_core::SyncMeta {
                id: row.try_get("id")?,
                sync_id: row.try_get("sync_id")?,
                created_at: millis_column(row, Self::TABLE.name(), "created_at")?,
                updated_at: millis_column(row, Self::TABLE.name(), "updated_at")?,
                is_synced: row.try_get("is_synced")?,
                is_deleted: row.try_get("is_deleted")?,
            },
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            start: millis_column(row, Self::TABLE.name(), "start_at")?,
            end: millis_column(row, Self::TABLE.name(), "end_at")?,
            is_all_day: row.try_get("is_all_day")?,
            location: row.try_get("location")?,
            color: row.try_get("color")?,
            calendar_id: row.try_get("calendar_id")?,
            recurrence_rule: row.try_get("recurrence_rule")?,
            reminder_minutes: row.try_get("reminder_minutes")?,
        })
    }
}

impl SyncRepository<Event> {
    /// Live events whose start lies in `[start, end]` (both inclusive),
    /// ordered by start then id.
    pub async fn query_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Event>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND start_at >= ?1 AND start_at <= ?2 \
             ORDER BY start_at ASC, id ASC",
        );
        self.fetch_all(
            sqlx::query(&sql)
                .bind(start.timestamp_millis())
                .bind(end.timestamp_millis()),
        )
        .await
    }

    /// Live events of one calendar, ordered by start then id.
    pub async fn query_by_calendar(&self, calendar_id: &str) -> DbResult<Vec<Event>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND calendar_id = ?1 ORDER BY start_at ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql).bind(calendar_id)).await
    }

    /// [`query_by_date_range`](Self::query_by_date_range) restricted to
    /// events whose calendar is live and visible.
    pub async fn query_visible_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Event>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND start_at >= ?1 AND start_at <= ?2 \
             AND calendar_id IN (SELECT id FROM calendars WHERE is_visible = 1 AND is_deleted = 0) \
             ORDER BY start_at ASC, id ASC",
        );
        self.fetch_all(
            sqlx::query(&sql)
                .bind(start.timestamp_millis())
                .bind(end.timestamp_millis()),
        )
        .await
    }

    /// Live events whose title, description or location contains `term`
    /// (case-insensitive for ASCII). An empty term matches nothing.
    pub async fn search(&self, term: &str) -> DbResult<Vec<Event>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let sql = Self::select(
            r"WHERE is_deleted = 0 AND (
                title LIKE ?1 ESCAPE '\'
                OR description LIKE ?1 ESCAPE '\'
                OR location LIKE ?1 ESCAPE '\'
            )
            ORDER BY start_at ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql).bind(like_pattern(term))).await
    }

    /// The next `limit` live events starting at or after `from`.
    pub async fn upcoming(&self, from: DateTime<Utc>, limit: u32) -> DbResult<Vec<Event>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND start_at >= ?1 ORDER BY start_at ASC, id ASC LIMIT ?2",
        );
        self.fetch_all(
            sqlx::query(&sql)
                .bind(from.timestamp_millis())
                .bind(i64::from(limit)),
        )
        .await
    }

    /// Number of live events starting in `[start, end]`.
    pub async fn count_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE is_deleted = 0 AND start_at >= ?1 AND start_at <= ?2",
        )
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Live events whose `calendar_id` names no live calendar.
    pub async fn find_dangling(&self) -> DbResult<Vec<Event>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 \
             AND calendar_id NOT IN (SELECT id FROM calendars WHERE is_deleted = 0) \
             ORDER BY start_at ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql)).await
    }

    /// Rewrites `calendar_id` values that hold a calendar's remote id into
    /// that calendar's local id.
    ///
    /// Pulled events can arrive before their calendar; they are stored with
    /// the remote reference and fixed up here once the calendar exists.
    /// Sync metadata is left alone: the remote representation is unchanged.
    pub async fn relink_calendar_refs(&self) -> DbResult<u64> {
        let relinked = sqlx::query(
            "UPDATE events SET calendar_id = \
                (SELECT c.id FROM calendars c WHERE c.sync_id = events.calendar_id) \
             WHERE calendar_id NOT IN (SELECT id FROM calendars) \
               AND calendar_id IN (SELECT sync_id FROM calendars WHERE sync_id IS NOT NULL)",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if relinked > 0 {
            debug!(relinked, "Calendar references relinked");
        }
        self.changes.publish(Table::Events, ChangeKind::Update, relinked);
        Ok(relinked)
    }

    /// Reactive [`query_by_date_range`](Self::query_by_date_range).
    pub fn watch_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'static, DbResult<Vec<Event>>> {
        let repo = self.clone();
        self.changes.watch(&[Table::Events], move || {
            let repo = repo.clone();
            async move { repo.query_by_date_range(start, end).await }
        })
    }

    /// Reactive [`query_by_calendar`](Self::query_by_calendar).
    pub fn watch_calendar(&self, calendar_id: &str) -> BoxStream<'static, DbResult<Vec<Event>>> {
        let repo = self.clone();
        let calendar_id = calendar_id.to_string();
        self.changes.watch(&[Table::Events], move || {
            let repo = repo.clone();
            let calendar_id = calendar_id.clone();
            async move { repo.query_by_calendar(&calendar_id).await }
        })
    }

    /// Reactive [`query_visible_in_range`](Self::query_visible_in_range).
    /// Re-queries when either events or calendars change.
    pub fn watch_visible_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'static, DbResult<Vec<Event>>> {
        let repo = self.clone();
        self.changes.watch(&[Table::Events, Table::Calendars], move || {
            let repo = repo.clone();
            async move { repo.query_visible_in_range(start, end).await }
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};
    use calsync_core::{clock, Calendar, CalendarType, SyncEntity, SyncState};
    use chrono::Duration;
    use futures_util::StreamExt;

    async fn setup() -> (Database, Calendar) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let work = Calendar::new("Work", "#1E88E5", CalendarType::Local).unwrap();
        db.calendars().insert(&work).await.unwrap();
        (db, work)
    }

    fn event_at(title: &str, start: DateTime<Utc>, calendar: &Calendar) -> Event {
        Event::new(title, start, start + Duration::minutes(30), calendar.id()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (db, work) = setup().await;
        let standup = event_at("Standup", clock::now(), &work)
            .location("Room 4")
            .reminder(10)
            .recurrence("FREQ=DAILY");

        db.events().insert(&standup).await.unwrap();

        let stored = db.events().get_by_id(standup.id()).await.unwrap().unwrap();
        assert_eq!(stored, standup);
        assert_eq!(stored.sync_state(), SyncState::LocalNew);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_constraint_violation() {
        let (db, work) = setup().await;
        let standup = event_at("Standup", clock::now(), &work);

        db.events().insert(&standup).await.unwrap();
        let err = db.events().insert(&standup).await.unwrap_err();

        match err {
            DbError::ConstraintViolation { value, .. } => assert_eq!(value, standup.meta.id),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_insert_batch_is_atomic() {
        let (db, work) = setup().await;
        let now = clock::now();
        let a = event_at("A", now, &work);
        let b = event_at("B", now, &work);
        let dup = a.clone();

        let err = db.events().insert_batch(&[b.clone(), a.clone(), dup]).await;
        assert!(err.is_err());
        assert!(db.events().get_by_id(b.id()).await.unwrap().is_none());

        assert_eq!(db.events().insert_batch(&[a, b]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (db, work) = setup().await;
        let ghost = event_at("Ghost", clock::now(), &work);

        let err = db.events().update(&ghost).await.unwrap_err();
        assert!(err.is_not_found());

        let err = db.events().mark_synced(ghost.id()).await.unwrap_err();
        assert!(err.is_not_found());
        let err = db.events().soft_delete(ghost.id()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_modify_bumps_revision_and_unsyncs() {
        let (db, work) = setup().await;
        let events = db.events();
        let mut standup = event_at("Standup", clock::now(), &work);
        standup.meta.sync_id = Some("remote-1".into());
        standup.meta.is_synced = true;
        events.insert(&standup).await.unwrap();

        let edited = events
            .modify(standup.id(), |e| {
                e.title = "Standup v2".into();
                // Metadata changes inside an edit are discarded
                e.meta.is_synced = true;
            })
            .await
            .unwrap();

        assert_eq!(edited.title, "Standup v2");
        assert!(!edited.meta.is_synced);
        assert!(edited.meta.updated_at > standup.meta.updated_at);
        assert_eq!(edited.sync_state(), SyncState::LocallyModified);
        assert_eq!(events.get_by_id(standup.id()).await.unwrap().unwrap(), edited);
    }

    #[tokio::test]
    async fn test_modify_rejects_invalid_and_tombstones() {
        let (db, work) = setup().await;
        let events = db.events();
        let standup = event_at("Standup", clock::now(), &work);
        events.insert(&standup).await.unwrap();

        let err = events.modify(standup.id(), |e| e.title.clear()).await.unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));

        events.soft_delete(standup.id()).await.unwrap();
        let err = events
            .modify(standup.id(), |e| e.title = "Back".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let (db, work) = setup().await;
        let events = db.events();
        let standup = event_at("Standup", clock::now(), &work);
        events.insert(&standup).await.unwrap();

        events.soft_delete(standup.id()).await.unwrap();
        let first = events.get_by_id(standup.id()).await.unwrap().unwrap();
        assert!(first.meta.is_deleted);
        assert!(!first.meta.is_synced);
        assert!(first.meta.updated_at > standup.meta.updated_at);

        events.soft_delete(standup.id()).await.unwrap();
        let second = events.get_by_id(standup.id()).await.unwrap().unwrap();
        assert_eq!(first, second);

        // Tombstones drop out of every view but stay readable by id
        assert!(events.query_by_calendar(work.id()).await.unwrap().is_empty());
        assert_eq!(events.query_unsynced().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_revision_beats_future_clock() {
        let (db, work) = setup().await;
        let events = db.events();
        // Record written by a device whose clock runs ahead
        let mut skewed = event_at("Skewed", clock::now(), &work);
        skewed.meta.updated_at = clock::now() + Duration::hours(1);
        events.insert(&skewed).await.unwrap();

        events.soft_delete(skewed.id()).await.unwrap();
        let stored = events.get_by_id(skewed.id()).await.unwrap().unwrap();
        assert_eq!(
            stored.meta.updated_at,
            skewed.meta.updated_at + Duration::milliseconds(1)
        );
    }

    #[tokio::test]
    async fn test_purge_respects_cutoff_and_sync_state() {
        let (db, work) = setup().await;
        let events = db.events();
        let now = clock::now();

        // Never reached the remote: purgeable once old enough
        let local_only = event_at("Local only", now, &work);
        // Deleted remotely confirmed
        let mut confirmed = event_at("Confirmed", now, &work);
        confirmed.meta.sync_id = Some("r-1".into());
        // Deletion still pending push
        let mut pending = event_at("Pending", now, &work);
        pending.meta.sync_id = Some("r-2".into());
        // Live
        let live = event_at("Live", now, &work);

        events
            .insert_batch(&[local_only.clone(), confirmed.clone(), pending.clone(), live.clone()])
            .await
            .unwrap();
        for e in [&local_only, &confirmed, &pending] {
            events.soft_delete(e.id()).await.unwrap();
        }
        events.mark_synced(confirmed.id()).await.unwrap();

        // Cutoff before the tombstones: nothing goes
        assert_eq!(
            events
                .purge_tombstones_older_than(now - Duration::days(1))
                .await
                .unwrap(),
            0
        );

        let purged = events
            .purge_tombstones_older_than(now + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert!(events.get_by_id(local_only.id()).await.unwrap().is_none());
        assert!(events.get_by_id(confirmed.id()).await.unwrap().is_none());
        assert!(events.get_by_id(pending.id()).await.unwrap().is_some());
        assert!(events.get_by_id(live.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_flags() {
        let (db, work) = setup().await;
        let events = db.events();
        let standup = event_at("Standup", clock::now(), &work);
        events.insert(&standup).await.unwrap();

        events.bind_sync_id(standup.id(), "remote-7").await.unwrap();
        assert!(!events.get_by_id(standup.id()).await.unwrap().unwrap().meta.is_synced);

        // Stale observation: refused
        let stale = standup.meta.updated_at - Duration::milliseconds(5);
        assert!(!events.mark_synced_if_unchanged(standup.id(), stale).await.unwrap());
        assert!(events
            .mark_synced_if_unchanged(standup.id(), standup.meta.updated_at)
            .await
            .unwrap());

        let by_sync = events.get_by_sync_id("remote-7").await.unwrap().unwrap();
        assert!(by_sync.meta.is_synced);
        assert!(events.query_unsynced().await.unwrap().is_empty());

        events.mark_unsynced("remote-7").await.unwrap();
        assert_eq!(events.count_unsynced().await.unwrap(), 1);
        assert!(events.mark_unsynced("nope").await.unwrap_err().is_not_found());

        // sync_id is unique per table
        let other = event_at("Other", clock::now(), &work);
        events.insert(&other).await.unwrap();
        let err = events.bind_sync_id(other.id(), "remote-7").await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_unsynced_order() {
        let (db, work) = setup().await;
        let events = db.events();
        let base = clock::now();

        let mut late = event_at("Late", base, &work);
        late.meta.updated_at = base + Duration::seconds(10);
        let mut early = event_at("Early", base, &work);
        early.meta.updated_at = base;
        events.insert_batch(&[late.clone(), early.clone()]).await.unwrap();

        let titles: Vec<_> = events
            .query_unsynced()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Early", "Late"]);
    }

    #[tokio::test]
    async fn test_date_range_and_search() {
        let (db, work) = setup().await;
        let events = db.events();
        let day = clock::now();

        let standup = event_at("Standup", day, &work).description("daily sync");
        let lunch = event_at("Lunch", day + Duration::hours(3), &work).location("Cafe 100%");
        let next_week = event_at("Planning", day + Duration::days(7), &work);
        events
            .insert_batch(&[next_week.clone(), lunch.clone(), standup.clone()])
            .await
            .unwrap();

        let today = events
            .query_by_date_range(day, day + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(today, vec![standup.clone(), lunch.clone()]);
        assert_eq!(
            events.count_in_range(day, day + Duration::hours(3)).await.unwrap(),
            2
        );

        assert_eq!(events.search("SYNC").await.unwrap(), vec![standup.clone()]);
        assert_eq!(events.search("100%").await.unwrap(), vec![lunch.clone()]);
        assert!(events.search("_").await.unwrap().is_empty());
        assert!(events.search("  ").await.unwrap().is_empty());

        let next_two = events.upcoming(day + Duration::minutes(1), 2).await.unwrap();
        assert_eq!(next_two, vec![lunch, next_week]);
    }

    #[tokio::test]
    async fn test_visible_range_and_dangling() {
        let (db, work) = setup().await;
        let hidden = Calendar::new("Hidden", "#000000", CalendarType::Local)
            .unwrap()
            .visible(false);
        db.calendars().insert(&hidden).await.unwrap();

        let now = clock::now();
        let shown = event_at("Shown", now, &work);
        let masked = event_at("Masked", now, &hidden);
        let orphan = Event::new("Orphan", now, now, "no-such-calendar").unwrap();
        db.events()
            .insert_batch(&[shown.clone(), masked, orphan.clone()])
            .await
            .unwrap();

        let visible = db
            .events()
            .query_visible_in_range(now, now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(visible, vec![shown]);

        assert_eq!(db.events().find_dangling().await.unwrap(), vec![orphan]);
    }

    #[tokio::test]
    async fn test_relink_calendar_refs() {
        let (db, _) = setup().await;
        let now = clock::now();
        let early = Event::new("Early", now, now, "remote-cal").unwrap();
        db.events().insert(&early).await.unwrap();
        assert_eq!(db.events().find_dangling().await.unwrap().len(), 1);

        let mut late = Calendar::new("Late", "#123456", CalendarType::ProviderA).unwrap();
        late.meta.sync_id = Some("remote-cal".into());
        db.calendars().insert(&late).await.unwrap();

        assert_eq!(db.events().relink_calendar_refs().await.unwrap(), 1);
        let fixed = db.events().get_by_id(early.id()).await.unwrap().unwrap();
        assert_eq!(fixed.calendar_id, late.meta.id);
        assert_eq!(fixed.meta.updated_at, early.meta.updated_at);
        assert!(db.events().find_dangling().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let (db, work) = setup().await;
        let events = db.events();
        let mut standup = event_at("Standup", clock::now(), &work);
        standup.meta.sync_id = Some("r-1".into());
        events.insert(&standup).await.unwrap();

        let mut remote = standup.clone();
        remote.title = "Remote title".into();
        remote.meta.updated_at = standup.meta.updated_at + Duration::seconds(5);
        remote.meta.is_synced = true;

        let stale = standup.meta.updated_at - Duration::seconds(1);
        assert!(!events.replace_if_unchanged(&remote, stale).await.unwrap());
        assert!(events
            .replace_if_unchanged(&remote, standup.meta.updated_at)
            .await
            .unwrap());
        assert_eq!(events.get_by_id(standup.id()).await.unwrap().unwrap(), remote);

        let deleted_at = remote.meta.updated_at + Duration::seconds(5);
        assert!(events
            .apply_remote_tombstone(standup.id(), remote.meta.updated_at, deleted_at)
            .await
            .unwrap());
        let tomb = events.get_by_id(standup.id()).await.unwrap().unwrap();
        assert!(tomb.meta.is_deleted && tomb.meta.is_synced);
        assert_eq!(tomb.meta.updated_at, deleted_at);
    }

    #[tokio::test]
    async fn test_watch_range_emits_on_change() {
        let (db, work) = setup().await;
        let now = clock::now();
        let mut view = db.events().watch_range(now, now + Duration::days(1));

        assert!(view.next().await.unwrap().unwrap().is_empty());

        let standup = event_at("Standup", now, &work);
        db.events().insert(&standup).await.unwrap();
        assert_eq!(view.next().await.unwrap().unwrap(), vec![standup.clone()]);

        db.events().soft_delete(standup.id()).await.unwrap();
        assert!(view.next().await.unwrap().unwrap().is_empty());
    }
}
