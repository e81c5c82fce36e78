//! # Repository Module
//!
//! Local store repositories for calsync.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  record.rs        SyncRepository<T: Record>                             │
//! │  ├── insert / insert_batch / update / modify                           │
//! │  ├── soft_delete / purge_tombstones_older_than                         │
//! │  ├── mark_synced / mark_unsynced / bind_sync_id                        │
//! │  └── get_by_id / get_by_sync_id / query_unsynced                       │
//! │       ▲                         ▲                                       │
//! │       │ impl Record for Event   │ impl Record for Calendar              │
//! │  event.rs                  calendar.rs                                  │
//! │  ├── query_by_date_range   ├── query_visible / list_all                │
//! │  ├── query_by_calendar     ├── set_primary_calendar                    │
//! │  ├── search / upcoming     ├── delete_calendar                         │
//! │  └── watch_range           └── watch_visible                           │
//! │                                                                         │
//! │  sync_state.rs    SyncStateRepository (cursor + failure counts)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`EventRepository`] - Events and their date/calendar views
//! - [`CalendarRepository`] - Calendars, visibility and the primary calendar
//! - [`SyncStateRepository`] - Remote cursor and per-record failure counts

pub mod calendar;
pub mod event;
pub mod record;
pub mod sync_state;

pub use calendar::CalendarRepository;
pub use event::EventRepository;
pub use record::{Record, SyncRepository};
pub use sync_state::{FailureRecord, SyncStateRepository, DEFAULT_SCOPE};
