//! # Remote Store
//!
//! The seam between the reconciliation engine and whatever holds the shared
//! copy of the data.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Remote Boundary                                 │
//! │                                                                         │
//! │  Local row (Event / Calendar)                                          │
//! │       │  EventPayload::from_event(&event, calendar_sync_id)            │
//! │       ▼                                                                 │
//! │  RemoteEntity ──► create_remote / update_remote ──► remote document    │
//! │                                                                         │
//! │  fetch_changes_since(cursor) ──► ChangeSet { records, cursor }         │
//! │       │  RemoteRecord { sync_id, updated_at, deleted, entity }         │
//! │       ▼                                                                 │
//! │  EventPayload::into_event(meta, local_calendar_id) ──► local row       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads never carry local ids. Events reference their calendar by the
//! calendar's `sync_id`; translation to and from local ids happens in the
//! push and pull phases.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calsync_core::{Calendar, CalendarType, EntityKind, Event, SyncMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Payloads
// =============================================================================

/// Event content as stored on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub location: Option<String>,
    pub color: String,
    /// Remote id (`sync_id`) of the owning calendar.
    pub calendar_id: String,
    pub recurrence_rule: Option<String>,
    pub reminder_minutes: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl EventPayload {
    /// Builds the payload for `event`, referencing its calendar by `calendar_ref`.
    pub fn from_event(event: &Event, calendar_ref: impl Into<String>) -> Self {
        EventPayload {
            title: event.title.clone(),
            description: event.description.clone(),
            start: event.start,
            end: event.end,
            is_all_day: event.is_all_day,
            location: event.location.clone(),
            color: event.color.clone(),
            calendar_id: calendar_ref.into(),
            recurrence_rule: event.recurrence_rule.clone(),
            reminder_minutes: event.reminder_minutes,
            created_at: event.meta.created_at,
        }
    }

    /// Builds a local event from the payload.
    pub fn into_event(self, meta: SyncMeta, calendar_id: impl Into<String>) -> Event {
        Event {
            meta,
            title: self.title,
            description: self.description,
            start: self.start,
            end: self.end,
            is_all_day: self.is_all_day,
            location: self.location,
            color: self.color,
            calendar_id: calendar_id.into(),
            recurrence_rule: self.recurrence_rule,
            reminder_minutes: self.reminder_minutes,
        }
    }
}

/// Calendar content as stored on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarPayload {
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub is_visible: bool,
    pub is_primary: bool,
    pub calendar_type: CalendarType,
    pub account_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CalendarPayload {
    pub fn from_calendar(calendar: &Calendar) -> Self {
        CalendarPayload {
            name: calendar.name.clone(),
            description: calendar.description.clone(),
            color: calendar.color.clone(),
            is_visible: calendar.is_visible,
            is_primary: calendar.is_primary,
            calendar_type: calendar.calendar_type,
            account_email: calendar.account_email.clone(),
            created_at: calendar.meta.created_at,
        }
    }

    pub fn into_calendar(self, meta: SyncMeta) -> Calendar {
        Calendar {
            meta,
            name: self.name,
            description: self.description,
            color: self.color,
            is_visible: self.is_visible,
            is_primary: self.is_primary,
            calendar_type: self.calendar_type,
            account_email: self.account_email,
        }
    }
}

/// A document sent to or received from the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteEntity {
    Event(EventPayload),
    Calendar(CalendarPayload),
}

impl RemoteEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            RemoteEntity::Event(_) => EntityKind::Event,
            RemoteEntity::Calendar(_) => EntityKind::Calendar,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            RemoteEntity::Event(e) => e.created_at,
            RemoteEntity::Calendar(c) => c.created_at,
        }
    }
}

/// One entry of the remote change feed: the latest state of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub sync_id: String,
    pub updated_at: DateTime<Utc>,
    /// The document is a remote tombstone; `entity` holds its last content.
    pub deleted: bool,
    pub entity: RemoteEntity,
}

impl RemoteRecord {
    pub fn kind(&self) -> EntityKind {
        self.entity.kind()
    }

    /// Sync metadata for a local row mirroring this record.
    pub fn meta_for(&self, local_id: impl Into<String>) -> SyncMeta {
        SyncMeta {
            id: local_id.into(),
            sync_id: Some(self.sync_id.clone()),
            created_at: self.entity.created_at(),
            updated_at: self.updated_at,
            is_synced: true,
            is_deleted: self.deleted,
        }
    }
}

/// Result of [`RemoteStore::update_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The remote holds a newer revision; nothing was written.
    Conflict,
}

/// Changes since a cursor, plus the cursor to resume from next time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub records: Vec<RemoteRecord>,
    pub cursor: String,
}

// =============================================================================
// RemoteStore Trait
// =============================================================================

/// The remote collaborator.
///
/// Implementations must be idempotent under retry: repeating an update with
/// the same `updated_at`, or deleting an already deleted document, succeeds.
///
/// ## Example
/// ```rust,ignore
/// let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemote::new());
/// let sync_id = remote.create_remote(&entity, event.meta.updated_at).await?;
/// ```
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stores a new document and returns its remote id.
    async fn create_remote(
        &self,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<String>;

    /// Replaces a document, unless the remote holds a newer revision.
    async fn update_remote(
        &self,
        sync_id: &str,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<UpdateOutcome>;

    /// Marks a document deleted.
    async fn delete_remote(&self, kind: EntityKind, sync_id: &str) -> SyncResult<()>;

    /// Documents changed after `cursor` (`None` = everything).
    async fn fetch_changes_since(&self, cursor: Option<&str>) -> SyncResult<ChangeSet>;
}

// =============================================================================
// Timed Remote
// =============================================================================

/// A [`RemoteStore`] handle whose every call is bounded by a timeout.
#[derive(Clone)]
pub struct TimedRemote {
    inner: Arc<dyn RemoteStore>,
    limit: Duration,
}

impl TimedRemote {
    pub fn new(inner: Arc<dyn RemoteStore>, limit: Duration) -> Self {
        TimedRemote { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn inner(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.inner)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => {
                let ms = u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX);
                warn!(operation, timeout_ms = ms, "Remote call timed out");
                Err(SyncError::Timeout(ms))
            }
        }
    }

    pub async fn create_remote(
        &self,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<String> {
        self.bounded("create_remote", self.inner.create_remote(entity, updated_at))
            .await
    }

    pub async fn update_remote(
        &self,
        sync_id: &str,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<UpdateOutcome> {
        self.bounded(
            "update_remote",
            self.inner.update_remote(sync_id, entity, updated_at),
        )
        .await
    }

    pub async fn delete_remote(&self, kind: EntityKind, sync_id: &str) -> SyncResult<()> {
        self.bounded("delete_remote", self.inner.delete_remote(kind, sync_id))
            .await
    }

    pub async fn fetch_changes_since(&self, cursor: Option<&str>) -> SyncResult<ChangeSet> {
        self.bounded("fetch_changes_since", self.inner.fetch_changes_since(cursor))
            .await
    }
}

impl std::fmt::Debug for TimedRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedRemote")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::clock;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_event_payload_carries_calendar_ref() {
        let start = clock::now();
        let event = Event::new("Standup", start, start + ChronoDuration::minutes(15), "local-cal")
            .unwrap()
            .location("Room 4");

        let payload = EventPayload::from_event(&event, "remote-cal");
        assert_eq!(payload.calendar_id, "remote-cal");
        assert_eq!(payload.created_at, event.meta.created_at);

        let back = payload.into_event(event.meta.clone(), "local-cal");
        assert_eq!(back, event);
    }

    #[test]
    fn test_remote_entity_json_is_tagged() {
        let cal = Calendar::with_default_color("Work", CalendarType::ProviderA).unwrap();
        let entity = RemoteEntity::Calendar(CalendarPayload::from_calendar(&cal));

        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["kind"], "calendar");
        assert_eq!(json["calendar_type"], "provider_a");
        assert!(json.get("id").is_none());

        let parsed: RemoteEntity = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), EntityKind::Calendar);
    }

    #[test]
    fn test_meta_for_mirrors_remote_revision() {
        let cal = Calendar::with_default_color("Work", CalendarType::Local).unwrap();
        let record = RemoteRecord {
            sync_id: "s-1".into(),
            updated_at: cal.meta.updated_at + ChronoDuration::seconds(3),
            deleted: false,
            entity: RemoteEntity::Calendar(CalendarPayload::from_calendar(&cal)),
        };

        let meta = record.meta_for("local-1");
        assert_eq!(meta.id, "local-1");
        assert_eq!(meta.sync_id.as_deref(), Some("s-1"));
        assert_eq!(meta.created_at, cal.meta.created_at);
        assert_eq!(meta.updated_at, record.updated_at);
        assert!(meta.is_synced);
    }
}
