//! # Calendar Repository
//!
//! Calendar storage, including the single-primary rule.
//!
//! ## Single Primary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  idx_calendars_single_primary: UNIQUE (is_primary)                      │
//! │                               WHERE is_primary = 1 AND is_deleted = 0   │
//! │                                                                         │
//! │  Writing a live primary calendar (insert, update, pull):                │
//! │    BEGIN                                                                │
//! │      UPDATE calendars SET is_primary = 0, is_synced = 0, updated_at++   │
//! │        WHERE is_primary = 1 AND is_deleted = 0 AND id != :id            │
//! │      INSERT / UPDATE :id with is_primary = 1                            │
//! │    COMMIT                                                               │
//! │                                                                         │
//! │  Readers see either the old primary or the new one, never two.         │
//! │  Demoted calendars are left unsynced so the change is pushed.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Demotions never promote anything, so a pull can leave no primary.
//! [`SyncRepository::restore_primary`] and `delete_calendar` hand primacy to
//! the oldest live calendar in that case.

use calsync_core::{clock, Calendar, CalendarType, SyncEntity, SyncMeta};
use futures_util::stream::BoxStream;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::notify::{ChangeKind, Table};
use crate::repository::record::{like_pattern, millis_column, Record, SqliteQuery, SyncRepository};

/// Repository for calendars.
pub type CalendarRepository = SyncRepository<Calendar>;

const DEMOTE_OTHER_PRIMARIES: &str = "UPDATE calendars \
     SET is_primary = 0, is_synced = 0, updated_at = MAX(?2, updated_at + 1) \
     WHERE is_primary = 1 AND is_deleted = 0 AND id != ?1";

const PROMOTE: &str = "UPDATE calendars \
     SET is_primary = 1, is_synced = 0, updated_at = MAX(?2, updated_at + 1) \
     WHERE id = ?1";

impl Record for Calendar {
    const TABLE: Table = Table::Calendars;

    const COLUMNS: &'static [&'static str] = &[
        "id",
        "sync_id",
        "name",
        "description",
        "color",
        "is_visible",
        "is_primary",
        "calendar_type",
        "account_email",
        "created_at",
        "updated_at",
        "is_synced",
        "is_deleted",
    ];

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.meta.id)
            .bind(self.meta.sync_id.as_deref())
            .bind(&self.name)
            .bind(self.description.as_deref())
            .bind(&self.color)
            .bind(self.is_visible)
            .bind(self.is_primary)
            .bind(self.calendar_type)
            .bind(self.account_email.as_deref())
            .bind(self.meta.created_at.timestamp_millis())
            .bind(self.meta.updated_at.timestamp_millis())
            .bind(self.meta.is_synced)
            .bind(self.meta.is_deleted)
    }

    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        Ok(Calendar {
            meta: SyncMeta {
                id: row.try_get("id")?,
                sync_id: row.try_get("sync_id")?,
                created_at: millis_column(row, Self::TABLE.name(), "created_at")?,
                updated_at: millis_column(row, Self::TABLE.name(), "updated_at")?,
                is_synced: row.try_get("is_synced")?,
                is_deleted: row.try_get("is_deleted")?,
            },
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            color: row.try_get("color")?,
            is_visible: row.try_get("is_visible")?,
            is_primary: row.try_get("is_primary")?,
            calendar_type: row.try_get("calendar_type")?,
            account_email: row.try_get("account_email")?,
        })
    }

    fn before_write(&self) -> Option<&'static str> {
        (self.is_primary && !self.meta.is_deleted).then_some(DEMOTE_OTHER_PRIMARIES)
    }
}

impl SyncRepository<Calendar> {
    /// Every live calendar, primary first, then by name.
    pub async fn list_all(&self) -> DbResult<Vec<Calendar>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 ORDER BY is_primary DESC, name COLLATE NOCASE ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql)).await
    }

    /// Live calendars marked visible, primary first, then by name.
    pub async fn query_visible(&self) -> DbResult<Vec<Calendar>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND is_visible = 1 \
             ORDER BY is_primary DESC, name COLLATE NOCASE ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql)).await
    }

    /// Live calendars of one origin.
    pub async fn query_by_type(&self, calendar_type: CalendarType) -> DbResult<Vec<Calendar>> {
        let sql = Self::select(
            "WHERE is_deleted = 0 AND calendar_type = ?1 ORDER BY name COLLATE NOCASE ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql).bind(calendar_type)).await
    }

    /// The live primary calendar, if any.
    pub async fn get_primary(&self) -> DbResult<Option<Calendar>> {
        let sql = Self::select("WHERE is_deleted = 0 AND is_primary = 1");
        self.fetch_optional(sqlx::query(&sql)).await
    }

    /// Live calendars whose name contains `term`. An empty term matches nothing.
    pub async fn search(&self, term: &str) -> DbResult<Vec<Calendar>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let sql = Self::select(
            r"WHERE is_deleted = 0 AND name LIKE ?1 ESCAPE '\' ORDER BY name COLLATE NOCASE ASC, id ASC",
        );
        self.fetch_all(sqlx::query(&sql).bind(like_pattern(term))).await
    }

    /// Shows or hides a calendar's events. A user edit like any other.
    pub async fn set_visibility(&self, id: &str, visible: bool) -> DbResult<Calendar> {
        self.modify(id, |calendar| calendar.is_visible = visible).await
    }

    /// Makes `id` the primary calendar, demoting the current one, atomically.
    ///
    /// Both calendars become unsynced. Selecting the calendar that is
    /// already primary changes nothing.
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if `id` is missing or a tombstone
    pub async fn set_primary_calendar(&self, id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<bool> =
            sqlx::query_scalar("SELECT is_primary FROM calendars WHERE id = ?1 AND is_deleted = 0")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        match current {
            None => return Err(DbError::not_found(Calendar::KIND.to_string(), id)),
            Some(true) => {
                debug!(id, "Calendar already primary");
                return Ok(());
            }
            Some(false) => {}
        }

        let now = clock::now().timestamp_millis();
        let demoted = sqlx::query(DEMOTE_OTHER_PRIMARIES)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(PROMOTE).bind(id).bind(now).execute(&mut *tx).await?;

        tx.commit().await?;

        info!(id, demoted, "Primary calendar changed");
        self.changes
            .publish(Table::Calendars, ChangeKind::Update, 1 + demoted);
        Ok(())
    }

    /// Deletes a calendar together with its events.
    ///
    /// The calendar and every live event in it become tombstones in one
    /// transaction. If the calendar was primary, the oldest remaining live
    /// calendar is promoted so that a primary still exists.
    ///
    /// ## Errors
    /// - [`DbError::NotFound`] if no row has this `id`
    pub async fn delete_calendar(&self, id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let was_primary: Option<bool> = sqlx::query_scalar(
            "SELECT is_primary AND NOT is_deleted FROM calendars WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(was_primary) = was_primary else {
            return Err(DbError::not_found(Calendar::KIND.to_string(), id));
        };

        let now = clock::now().timestamp_millis();
        let calendars_deleted = sqlx::query(
            "UPDATE calendars SET is_deleted = 1, is_synced = 0, \
             updated_at = MAX(?2, updated_at + 1) WHERE id = ?1 AND is_deleted = 0",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let events_deleted = sqlx::query(
            "UPDATE events SET is_deleted = 1, is_synced = 0, \
             updated_at = MAX(?2, updated_at + 1) WHERE calendar_id = ?1 AND is_deleted = 0",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut promoted = 0;
        if was_primary {
            if let Some(successor) = promote_oldest(&mut tx, now).await? {
                promoted = 1;
                info!(deleted = id, promoted = %successor, "Primary calendar reassigned");
            }
        }

        tx.commit().await?;

        debug!(id, events_deleted, "Calendar deleted");
        self.changes
            .publish(Table::Calendars, ChangeKind::Delete, calendars_deleted + promoted);
        self.changes
            .publish(Table::Events, ChangeKind::Delete, events_deleted);
        Ok(())
    }

    /// Promotes the oldest live calendar if calendars exist but none is
    /// primary. Returns the promoted calendar's id.
    ///
    /// The choice orders by `created_at`, then `sync_id`, so devices holding
    /// the same calendars pick the same one. The promoted row becomes
    /// unsynced and is pushed like any other edit.
    pub async fn restore_primary(&self) -> DbResult<Option<String>> {
        let mut tx = self.pool.begin().await?;

        let has_primary: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM calendars WHERE is_primary = 1 AND is_deleted = 0)",
        )
        .fetch_one(&mut *tx)
        .await?;
        if has_primary {
            return Ok(None);
        }

        let promoted = promote_oldest(&mut tx, clock::now().timestamp_millis()).await?;
        tx.commit().await?;

        if let Some(id) = &promoted {
            info!(id = %id, "Primary calendar restored");
            self.changes.publish(Table::Calendars, ChangeKind::Update, 1);
        }
        Ok(promoted)
    }

    /// Reactive [`query_visible`](Self::query_visible).
    pub fn watch_visible(&self) -> BoxStream<'static, DbResult<Vec<Calendar>>> {
        let repo = self.clone();
        self.changes.watch(&[Table::Calendars], move || {
            let repo = repo.clone();
            async move { repo.query_visible().await }
        })
    }

    /// Reactive [`list_all`](Self::list_all).
    pub fn watch_all(&self) -> BoxStream<'static, DbResult<Vec<Calendar>>> {
        let repo = self.clone();
        self.changes.watch(&[Table::Calendars], move || {
            let repo = repo.clone();
            async move { repo.list_all().await }
        })
    }
}

/// Makes the oldest live calendar primary on `conn`.
async fn promote_oldest(conn: &mut SqliteConnection, now: i64) -> DbResult<Option<String>> {
    let successor: Option<String> = sqlx::query_scalar(
        "SELECT id FROM calendars WHERE is_deleted = 0 \
         ORDER BY created_at ASC, sync_id ASC, id ASC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(successor) = &successor {
        sqlx::query(PROMOTE)
            .bind(successor)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    }
    Ok(successor)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use calsync_core::{Event, SyncState};
    use chrono::Duration;
    use futures_util::StreamExt;

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn calendar(name: &str) -> Calendar {
        Calendar::with_default_color(name, CalendarType::Local).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let db = setup().await;
        let cal = calendar("Team")
            .description("shared")
            .account("team@example.com");
        let mut provider = calendar("Provider");
        provider.calendar_type = CalendarType::ProviderB;

        db.calendars().insert_batch(&[cal.clone(), provider.clone()]).await.unwrap();

        assert_eq!(db.calendars().get_by_id(cal.id()).await.unwrap().unwrap(), cal);
        assert_eq!(
            db.calendars()
                .query_by_type(CalendarType::ProviderB)
                .await
                .unwrap(),
            vec![provider]
        );
    }

    #[tokio::test]
    async fn test_inserting_primary_demotes_previous() {
        let db = setup().await;
        let calendars = db.calendars();
        let mut personal = calendar("Personal").primary(true);
        personal.meta.sync_id = Some("r-personal".into());
        personal.meta.is_synced = true;
        calendars.insert(&personal).await.unwrap();

        let work = calendar("Work").primary(true);
        calendars.insert(&work).await.unwrap();

        assert_eq!(calendars.get_primary().await.unwrap().unwrap().meta.id, work.meta.id);
        let demoted = calendars.get_by_id(personal.id()).await.unwrap().unwrap();
        assert!(!demoted.is_primary);
        assert_eq!(demoted.sync_state(), SyncState::LocallyModified);
        assert!(demoted.meta.updated_at > personal.meta.updated_at);
    }

    #[tokio::test]
    async fn test_set_primary_calendar() {
        let db = setup().await;
        let calendars = db.calendars();
        let a = calendar("A").primary(true);
        let b = calendar("B");
        calendars.insert_batch(&[a.clone(), b.clone()]).await.unwrap();

        calendars.set_primary_calendar(b.id()).await.unwrap();

        let listed = calendars.list_all().await.unwrap();
        assert_eq!(listed[0].meta.id, b.meta.id);
        assert!(listed[0].is_primary);
        assert!(!listed[1].is_primary);
        assert!(listed.iter().all(|c| !c.is_synced()));

        // No-op when already primary
        let before = calendars.get_by_id(b.id()).await.unwrap().unwrap();
        calendars.set_primary_calendar(b.id()).await.unwrap();
        assert_eq!(calendars.get_by_id(b.id()).await.unwrap().unwrap(), before);

        assert!(calendars
            .set_primary_calendar("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_primary_switch_never_shows_two() {
        let path = std::env::temp_dir().join(format!("calsync-primary-{}.db", calsync_core::generate_id()));
        let db = Database::new(DbConfig::new(&path).max_connections(4))
            .await
            .unwrap();
        let calendars = db.calendars();
        let a = calendar("A").primary(true);
        let b = calendar("B");
        calendars.insert_batch(&[a.clone(), b.clone()]).await.unwrap();

        let reader = {
            let pool = db.pool().clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let primaries: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM calendars WHERE is_primary = 1 AND is_deleted = 0",
                    )
                    .fetch_one(&pool)
                    .await
                    .unwrap();
                    assert_eq!(primaries, 1);
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..20 {
            let target = if i % 2 == 0 { b.id() } else { a.id() };
            calendars.set_primary_calendar(target).await.unwrap();
        }

        reader.await.unwrap();
        db.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_delete_primary_promotes_oldest_and_cascades() {
        let db = setup().await;
        let calendars = db.calendars();

        let mut home = calendar("Home").primary(true);
        let mut older = calendar("Older");
        let newer = calendar("Newer");
        older.meta.created_at = older.meta.created_at - Duration::days(2);
        home.meta.created_at = home.meta.created_at - Duration::days(3);
        calendars
            .insert_batch(&[home.clone(), older.clone(), newer.clone()])
            .await
            .unwrap();

        let start = clock::now();
        let dinner = Event::new("Dinner", start, start + Duration::hours(1), home.id()).unwrap();
        db.events().insert(&dinner).await.unwrap();

        calendars.delete_calendar(home.id()).await.unwrap();

        let primary = calendars.get_primary().await.unwrap().unwrap();
        assert_eq!(primary.meta.id, older.meta.id);
        assert!(!primary.is_synced());

        let deleted = db.events().get_by_id(dinner.id()).await.unwrap().unwrap();
        assert!(deleted.meta.is_deleted);
        assert!(db.events().find_dangling().await.unwrap().is_empty());

        // Deleting again is harmless
        calendars.delete_calendar(home.id()).await.unwrap();
        assert!(calendars.delete_calendar("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restore_primary_picks_oldest_then_sync_id() {
        let db = setup().await;
        let calendars = db.calendars();
        assert_eq!(calendars.restore_primary().await.unwrap(), None);

        let created = clock::now() - Duration::days(1);
        let late = calendar("Late");
        let mut b = calendar("B");
        let mut a = calendar("A");
        b.meta.created_at = created;
        b.meta.sync_id = Some("remote-b".into());
        a.meta.created_at = created;
        a.meta.sync_id = Some("remote-a".into());
        calendars
            .insert_batch(&[late.clone(), b.clone(), a.clone()])
            .await
            .unwrap();

        let promoted = calendars.restore_primary().await.unwrap();
        assert_eq!(promoted.as_deref(), Some(a.id()));
        let primary = calendars.get_primary().await.unwrap().unwrap();
        assert_eq!(primary.meta.id, a.meta.id);
        assert!(!primary.is_synced());
        assert!(primary.meta.updated_at > a.meta.updated_at);

        // Already has one
        assert_eq!(calendars.restore_primary().await.unwrap(), None);
        let primaries = calendars
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_primary)
            .count();
        assert_eq!(primaries, 1);
    }

    #[tokio::test]
    async fn test_visibility_and_search() {
        let db = setup().await;
        let calendars = db.calendars();
        let work = calendar("Work");
        let holidays = calendar("Public Holidays");
        calendars.insert_batch(&[work.clone(), holidays.clone()]).await.unwrap();

        let hidden = calendars.set_visibility(holidays.id(), false).await.unwrap();
        assert!(!hidden.is_visible);
        assert!(!hidden.is_synced());

        let visible: Vec<_> = calendars
            .query_visible()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(visible, vec!["Work"]);

        assert_eq!(calendars.search("holi").await.unwrap().len(), 1);
        assert!(calendars.search("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_visible() {
        let db = setup().await;
        let calendars = db.calendars();
        let mut view = calendars.watch_visible();
        assert!(view.next().await.unwrap().unwrap().is_empty());

        let work = calendar("Work");
        calendars.insert(&work).await.unwrap();
        assert_eq!(view.next().await.unwrap().unwrap(), vec![work.clone()]);

        calendars.set_visibility(work.id(), false).await.unwrap();
        assert!(view.next().await.unwrap().unwrap().is_empty());
    }
}
