//! # Domain Types
//!
//! The two synchronized record types and the metadata they share.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │                    ┌───────────────────────────┐                        │
//! │                    │        SyncMeta           │                        │
//! │                    │  ───────────────────────  │                        │
//! │                    │  id (local UUID)          │                        │
//! │                    │  sync_id (remote, opt)    │                        │
//! │                    │  created_at / updated_at  │                        │
//! │                    │  is_synced / is_deleted   │                        │
//! │                    └─────────────┬─────────────┘                        │
//! │                 ┌────────────────┴────────────────┐                     │
//! │  ┌──────────────┴──────────┐      ┌───────────────┴───────────┐        │
//! │  │         Event           │      │         Calendar          │        │
//! │  │  ─────────────────────  │      │  ───────────────────────  │        │
//! │  │  title, description     │      │  name, description        │        │
//! │  │  start, end, all_day    │      │  color, is_visible        │        │
//! │  │  location, color        │ ───► │  is_primary               │        │
//! │  │  calendar_id            │      │  calendar_type            │        │
//! │  │  recurrence, reminder   │      │  account_email            │        │
//! │  └─────────────────────────┘      └───────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every record has:
//! - `id`: UUID v4 generated on this device, immutable, used for local relations
//! - `sync_id`: assigned by the remote on first successful push, used to
//!   correlate the local row with its remote document
//!
//! Associations are string keys only (`Event::calendar_id`). No record holds a
//! reference to another record.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::state::{SyncEvent, SyncState};
use crate::validation::{self, ValidationResult};
use crate::DEFAULT_COLOR;

// =============================================================================
// Entity Kind
// =============================================================================

/// Which table / remote collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    Calendar,
}

impl EntityKind {
    /// Stable lowercase name, used as a table tag and in persisted sync state.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::Calendar => "calendar",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Metadata shared by every synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Locally generated identifier (UUID v4). Never changes.
    pub id: String,

    /// Remote-assigned identifier; `None` until the remote accepted the record.
    pub sync_id: Option<String>,

    /// When the record was first created (on whichever device created it).
    pub created_at: DateTime<Utc>,

    /// Revision timestamp. Strictly increases on every mutation.
    pub updated_at: DateTime<Utc>,

    /// True only while local content matches the last confirmed remote state.
    pub is_synced: bool,

    /// Tombstone flag.
    pub is_deleted: bool,
}

impl SyncMeta {
    /// Metadata for a record created on this device right now.
    pub fn new_local() -> Self {
        let now = clock::now();
        SyncMeta {
            id: generate_id(),
            sync_id: None,
            created_at: now,
            updated_at: now,
            is_synced: false,
            is_deleted: false,
        }
    }

    /// Equality over every field except `is_synced`.
    pub fn eq_ignoring_sync_flag(&self, other: &SyncMeta) -> bool {
        self.id == other.id
            && self.sync_id == other.sync_id
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.is_deleted == other.is_deleted
    }
}

/// Total order over revisions: `updated_at`, then `id` lexically.
///
/// Two revisions of the same record differ only in `updated_at`; the `id`
/// tie-break keeps sorting deterministic across records.
pub fn revision_cmp(a: &SyncMeta, b: &SyncMeta) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Generates a new local record id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// SyncEntity Trait
// =============================================================================

/// Behaviour shared by [`Event`] and [`Calendar`].
///
/// Implementors only expose their metadata and content comparison; the sync
/// rules (state derivation, user mutation, pull overwrite) are provided here
/// once for both record types.
pub trait SyncEntity: Clone + Send + Sync + 'static {
    /// Table / collection this type lives in.
    const KIND: EntityKind;

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Equality over the content fields the remote transmits, plus the
    /// tombstone flag. Ignores id, sync id, timestamps and `is_synced`.
    fn content_eq(&self, other: &Self) -> bool;

    /// Copies content fields (and the tombstone flag) from `other`,
    /// leaving this record's metadata untouched.
    fn copy_content_from(&mut self, other: &Self);

    /// Checks required fields and formats.
    fn validate(&self) -> ValidationResult<()>;

    // -------------------------------------------------------------------------
    // Provided
    // -------------------------------------------------------------------------

    fn id(&self) -> &str {
        &self.meta().id
    }

    fn sync_id(&self) -> Option<&str> {
        self.meta().sync_id.as_deref()
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.meta().updated_at
    }

    fn is_synced(&self) -> bool {
        self.meta().is_synced
    }

    fn is_deleted(&self) -> bool {
        self.meta().is_deleted
    }

    /// Structural equality over all fields except `is_synced`.
    fn sync_eq(&self, other: &Self) -> bool {
        self.meta().eq_ignoring_sync_flag(other.meta()) && self.content_eq(other)
    }

    /// Lifecycle state derived from the flags.
    fn sync_state(&self) -> SyncState {
        SyncState::of(self.meta())
    }

    /// Records a user edit: bumps the revision and clears `is_synced`.
    ///
    /// Fails for tombstones; a deleted record cannot be edited.
    fn mark_user_modified(&mut self) -> CoreResult<SyncState> {
        let next = self.sync_state().apply(SyncEvent::UserEdit)?;
        let meta = self.meta_mut();
        meta.updated_at = clock::next_revision(meta.updated_at);
        meta.is_synced = false;
        Ok(next)
    }
}

// =============================================================================
// Calendar Type
// =============================================================================

/// Where a calendar comes from.
///
/// Provider variants stay opaque: this crate does not know which service is
/// behind each one, only that they are distinct remote origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CalendarType {
    /// Created on this device.
    #[default]
    Local,
    ProviderA,
    ProviderB,
    ProviderC,
}

impl CalendarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarType::Local => "local",
            CalendarType::ProviderA => "provider_a",
            CalendarType::ProviderB => "provider_b",
            CalendarType::ProviderC => "provider_c",
        }
    }
}

impl fmt::Display for CalendarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalendarType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(CalendarType::Local),
            "provider_a" => Ok(CalendarType::ProviderA),
            "provider_b" => Ok(CalendarType::ProviderB),
            "provider_c" => Ok(CalendarType::ProviderC),
            other => Err(ValidationError::InvalidFormat {
                field: "calendar_type".to_string(),
                reason: format!("unknown calendar type '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Calendar
// =============================================================================

/// A calendar that groups events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(flatten)]
    pub meta: SyncMeta,

    /// Display name.
    pub name: String,

    pub description: Option<String>,

    /// Display color (`#RRGGBB`).
    pub color: String,

    /// Whether its events are shown.
    pub is_visible: bool,

    /// At most one non-deleted calendar is primary; the store enforces it.
    pub is_primary: bool,

    pub calendar_type: CalendarType,

    /// Owning account for provider calendars.
    pub account_email: Option<String>,
}

impl Calendar {
    /// Creates a new local calendar after validating required fields.
    ///
    /// ## Example
    /// ```rust
    /// use calsync_core::{Calendar, CalendarType, SyncEntity};
    ///
    /// let cal = Calendar::new("Work", "#1E88E5", CalendarType::Local).unwrap();
    /// assert!(!cal.is_synced());
    /// assert!(cal.is_visible);
    /// assert!(Calendar::new("", "#1E88E5", CalendarType::Local).is_err());
    /// ```
    pub fn new(
        name: impl Into<String>,
        color: impl Into<String>,
        calendar_type: CalendarType,
    ) -> CoreResult<Self> {
        let calendar = Calendar {
            meta: SyncMeta::new_local(),
            name: name.into(),
            description: None,
            color: color.into(),
            is_visible: true,
            is_primary: false,
            calendar_type,
            account_email: None,
        };
        calendar.validate()?;
        Ok(calendar)
    }

    /// Creates a calendar with the default color.
    pub fn with_default_color(name: impl Into<String>, calendar_type: CalendarType) -> CoreResult<Self> {
        Self::new(name, DEFAULT_COLOR, calendar_type)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }

    pub fn visible(mut self, is_visible: bool) -> Self {
        self.is_visible = is_visible;
        self
    }

    pub fn account(mut self, email: impl Into<String>) -> Self {
        self.account_email = Some(email.into());
        self
    }
}

impl SyncEntity for Calendar {
    const KIND: EntityKind = EntityKind::Calendar;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn content_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.color == other.color
            && self.is_visible == other.is_visible
            && self.is_primary == other.is_primary
            && self.calendar_type == other.calendar_type
            && self.account_email == other.account_email
            && self.meta.is_deleted == other.meta.is_deleted
    }

    fn copy_content_from(&mut self, other: &Self) {
        self.name = other.name.clone();
        self.description = other.description.clone();
        self.color = other.color.clone();
        self.is_visible = other.is_visible;
        self.is_primary = other.is_primary;
        self.calendar_type = other.calendar_type;
        self.account_email = other.account_email.clone();
        self.meta.is_deleted = other.meta.is_deleted;
    }

    fn validate(&self) -> ValidationResult<()> {
        validation::validate_calendar_name(&self.name)?;
        validation::validate_color(&self.color)?;
        validation::validate_description(self.description.as_deref())?;
        validation::validate_account_email(self.account_email.as_deref())?;
        Ok(())
    }
}

// =============================================================================
// Event
// =============================================================================

/// A calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub title: String,

    pub description: Option<String>,

    pub start: DateTime<Utc>,

    pub end: DateTime<Utc>,

    pub is_all_day: bool,

    pub location: Option<String>,

    /// Display color (`#RRGGBB`).
    pub color: String,

    /// Owning calendar's local id.
    pub calendar_id: String,

    /// Opaque recurrence rule (e.g. an RRULE string); never interpreted here.
    pub recurrence_rule: Option<String>,

    /// Minutes before `start` to remind; `None` for no reminder.
    pub reminder_minutes: Option<i32>,
}

impl Event {
    /// Creates a new local event after validating required fields.
    ///
    /// ## Example
    /// ```rust
    /// use calsync_core::Event;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let event = Event::new("Standup", start, start + Duration::minutes(15), "cal-1").unwrap();
    /// assert!(event.meta.sync_id.is_none());
    ///
    /// assert!(Event::new("Standup", start, start - Duration::minutes(1), "cal-1").is_err());
    /// ```
    pub fn new(
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar_id: impl Into<String>,
    ) -> CoreResult<Self> {
        let calendar_id = calendar_id.into();
        if calendar_id.trim().is_empty() {
            return Err(CoreError::Validation(ValidationError::required("calendar_id")));
        }

        let event = Event {
            meta: SyncMeta::new_local(),
            title: title.into(),
            description: None,
            start: clock::truncate(start),
            end: clock::truncate(end),
            is_all_day: false,
            location: None,
            color: DEFAULT_COLOR.to_string(),
            calendar_id,
            recurrence_rule: None,
            reminder_minutes: None,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn all_day(mut self, is_all_day: bool) -> Self {
        self.is_all_day = is_all_day;
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn recurrence(mut self, rule: impl Into<String>) -> Self {
        self.recurrence_rule = Some(rule.into());
        self
    }

    pub fn reminder(mut self, minutes: i32) -> Self {
        self.reminder_minutes = Some(minutes);
        self
    }

    /// When the reminder should fire, if one is set.
    pub fn reminder_at(&self) -> Option<DateTime<Utc>> {
        self.reminder_minutes
            .map(|m| self.start - chrono::Duration::minutes(i64::from(m)))
    }
}

impl SyncEntity for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn content_eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.description == other.description
            && self.start == other.start
            && self.end == other.end
            && self.is_all_day == other.is_all_day
            && self.location == other.location
            && self.color == other.color
            && self.calendar_id == other.calendar_id
            && self.recurrence_rule == other.recurrence_rule
            && self.reminder_minutes == other.reminder_minutes
            && self.meta.is_deleted == other.meta.is_deleted
    }

    fn copy_content_from(&mut self, other: &Self) {
        self.title = other.title.clone();
        self.description = other.description.clone();
        self.start = other.start;
        self.end = other.end;
        self.is_all_day = other.is_all_day;
        self.location = other.location.clone();
        self.color = other.color.clone();
        self.calendar_id = other.calendar_id.clone();
        self.recurrence_rule = other.recurrence_rule.clone();
        self.reminder_minutes = other.reminder_minutes;
        self.meta.is_deleted = other.meta.is_deleted;
    }

    fn validate(&self) -> ValidationResult<()> {
        validation::validate_title(&self.title)?;
        validation::validate_time_range(self.start, self.end)?;
        validation::validate_color(&self.color)?;
        validation::validate_description(self.description.as_deref())?;
        validation::validate_reminder(self.reminder_minutes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn standup() -> Event {
        let start = clock::now();
        Event::new("Standup", start, start + Duration::minutes(15), "cal-1").unwrap()
    }

    #[test]
    fn test_new_event_is_local_new() {
        let event = standup();
        assert_eq!(event.sync_state(), SyncState::LocalNew);
        assert_eq!(event.color, DEFAULT_COLOR);
        assert_eq!(event.meta.created_at, event.meta.updated_at);
    }

    #[test]
    fn test_event_requires_title_and_calendar() {
        let start = clock::now();
        assert!(Event::new(" ", start, start, "cal-1").is_err());
        assert!(Event::new("Standup", start, start, "").is_err());
    }

    #[test]
    fn test_sync_eq_ignores_sync_flag_only() {
        let a = standup();
        let mut b = a.clone();
        b.meta.is_synced = true;
        assert!(a.sync_eq(&b));

        b.title = "Standup v2".into();
        assert!(!a.sync_eq(&b));

        let mut c = a.clone();
        c.meta.sync_id = Some("remote-1".into());
        assert!(!a.sync_eq(&c));
        assert!(a.content_eq(&c));
    }

    #[test]
    fn test_user_edit_bumps_revision_and_clears_flag() {
        let mut event = standup();
        event.meta.is_synced = true;
        event.meta.sync_id = Some("remote-1".into());
        let before = event.meta.updated_at;

        let state = event.mark_user_modified().unwrap();

        assert_eq!(state, SyncState::LocallyModified);
        assert!(!event.meta.is_synced);
        assert!(event.meta.updated_at > before);
    }

    #[test]
    fn test_tombstone_cannot_be_edited() {
        let mut event = standup();
        event.meta.is_deleted = true;
        assert!(matches!(
            event.mark_user_modified(),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_copy_content_keeps_identity() {
        let mut local = standup();
        let mut remote = standup();
        remote.title = "Retro".into();
        remote.meta.is_deleted = true;

        local.copy_content_from(&remote);

        assert_eq!(local.title, "Retro");
        assert!(local.meta.is_deleted);
        assert_ne!(local.meta.id, remote.meta.id);
        assert!(local.content_eq(&remote));
    }

    #[test]
    fn test_revision_order_breaks_ties_by_id() {
        let mut a = SyncMeta::new_local();
        let mut b = a.clone();
        a.id = "a".into();
        b.id = "b".into();
        assert_eq!(revision_cmp(&a, &b), Ordering::Less);

        b.updated_at = a.updated_at - Duration::milliseconds(1);
        assert_eq!(revision_cmp(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_calendar_type_round_trip() {
        for ty in [
            CalendarType::Local,
            CalendarType::ProviderA,
            CalendarType::ProviderB,
            CalendarType::ProviderC,
        ] {
            assert_eq!(ty.as_str().parse::<CalendarType>().unwrap(), ty);
        }
        assert!("exchange".parse::<CalendarType>().is_err());
    }

    #[test]
    fn test_calendar_json_shape() {
        let cal = Calendar::with_default_color("Personal", CalendarType::Local)
            .unwrap()
            .primary(true);
        let json = serde_json::to_value(&cal).unwrap();

        // Metadata is flattened next to content fields
        assert_eq!(json["name"], "Personal");
        assert_eq!(json["calendar_type"], "local");
        assert_eq!(json["is_primary"], true);
        assert!(json.get("meta").is_none());
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_reminder_at() {
        let event = standup().reminder(10);
        assert_eq!(event.reminder_at(), Some(event.start - Duration::minutes(10)));
    }
}
