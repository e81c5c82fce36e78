//! # calsync-db: Local Store Adapter
//!
//! Durable local storage for events and calendars, built on SQLite via sqlx.
//! Every user-facing read and write goes through this crate; the sync engine
//! uses the same repositories.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        calsync Data Flow                                │
//! │                                                                         │
//! │  UI / caller                      calsync-sync (Reconciler)            │
//! │       │                                  │                              │
//! │       ▼                                  ▼                              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   calsync-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │ Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ EventRepo     │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ CalendarRepo  │    │ 001_calendar │  │   │
//! │  │   │ ChangeFeed    │    │ SyncStateRepo │    │ 002_sync     │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/calsync/calsync.db                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`notify`] - Post-commit change feed and reactive views
//! - [`error`] - Database error types
//! - [`repository`] - Event, calendar and sync-state repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/calsync.db")).await?;
//!
//! db.calendars().insert(&work).await?;
//! db.events().insert(&standup).await?;
//!
//! let mut today = db.events().watch_range(start, end);
//! while let Some(events) = today.next().await { /* render */ }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod notify;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use notify::{ChangeFeed, ChangeKind, Table, TableChange};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::{
    CalendarRepository, EventRepository, FailureRecord, Record, SyncRepository,
    SyncStateRepository, DEFAULT_SCOPE,
};
