//! # calsync-core: Entity Model and Sync State Machine
//!
//! Pure types and rules for the offline-first calendar sync core. Nothing in
//! this crate touches the database or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        calsync Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              calsync-sync (Reconciliation Engine)               │   │
//! │  │      push phase ──► remote ──► pull phase ──► retention sweep   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              calsync-db (Local Store Adapter)                   │   │
//! │  │      SQLite repositories, change feed, reactive views           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ calsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   state   │  │   clock   │  │ validation│  │   │
//! │  │   │  Event    │  │ SyncState │  │ revisions │  │   rules   │  │   │
//! │  │   │ Calendar  │  │ SyncEvent │  │  (LWW)    │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Event, Calendar, shared [`SyncMeta`] and the [`SyncEntity`] trait
//! - [`state`] - Sync lifecycle states and the transition table
//! - [`clock`] - Millisecond timestamps and monotonic revision bumps
//! - [`validation`] - Field rules applied at construction and on edit
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use calsync_core::{Calendar, CalendarType, Event, SyncEntity, SyncState};
//! use chrono::{Duration, Utc};
//!
//! let work = Calendar::new("Work", "#1E88E5", CalendarType::Local).unwrap();
//! let start = Utc::now();
//! let mut standup = Event::new("Standup", start, start + Duration::minutes(15), work.id()).unwrap();
//! assert_eq!(standup.sync_state(), SyncState::LocalNew);
//!
//! // Pretend the remote accepted it
//! standup.meta.sync_id = Some("remote-42".into());
//! standup.meta.is_synced = true;
//!
//! // A user edit makes it pending again
//! standup.title = "Standup v2".into();
//! assert_eq!(standup.mark_user_modified().unwrap(), SyncState::LocallyModified);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod state;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use state::{SyncEvent, SyncState};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Color given to new events and calendars when none is chosen.
pub const DEFAULT_COLOR: &str = "#6750A4";

/// Maximum event title length (characters).
pub const MAX_TITLE_LEN: usize = 500;

/// Maximum calendar name length (characters).
pub const MAX_NAME_LEN: usize = 200;

/// Maximum description length (characters).
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Longest reminder lead time: four weeks, in minutes.
pub const MAX_REMINDER_MINUTES: i64 = 4 * 7 * 24 * 60;
