//! # calsync-sync: Reconciliation Engine for CalSync
//!
//! Keeps the local calendar store and a remote store convergent. Every
//! user edit lands in the local store first; this crate pushes those edits,
//! pulls remote changes with last-writer-wins, and sweeps old tombstones.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncAgent (background scheduler)                 │  │
//! │  │  auto: every poll interval   manual: sync_now()   offline: idle  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                 Reconciler (one cycle, single-flight)            │  │
//! │  └───────┬──────────────────────┬──────────────────────┬────────────┘  │
//! │          ▼                      ▼                      ▼               │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
//! │  │    Outbox      │  │     Inbound        │  │  Sweep + Scan      │    │
//! │  │                │  │                    │  │                    │    │
//! │  │ Pushes unsynced│  │ Pulls changes since│  │ Purges old         │    │
//! │  │ rows, records  │  │ cursor, applies    │  │ tombstones, reports│    │
//! │  │ failures       │  │ last-writer-wins   │  │ anomalies          │    │
//! │  └───────┬────────┘  └─────────┬──────────┘  └────────────────────┘    │
//! │          │                     │                                        │
//! │          ▼                     ▼                                        │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │        TimedRemote ──► dyn RemoteStore (MemoryRemote, ...)       │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` scheduler, status and handle
//! - [`config`] - Sync configuration (mode, device ID, timeouts, retention)
//! - [`error`] - Sync error types
//! - [`reconciler`] - One reconciliation cycle and its report
//! - [`remote`] - `RemoteStore` trait and payload types
//! - [`memory`] - In-process `RemoteStore` with fault injection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calsync_sync::{MemoryRemote, SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let handle = SyncAgent::new(config, database, Arc::new(MemoryRemote::new()))
//!     .start()
//!     .await?;
//!
//! let report = handle.sync_now().await?;
//! println!("{}", report);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod error;
pub mod memory;
pub mod reconciler;
pub mod remote;

mod inbound;
mod outbox;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{
    AgentState, NoOpEmitter, SyncAgent, SyncAgentBuilder, SyncAgentHandle, SyncEventEmitter,
    SyncStatus,
};
pub use config::{SyncConfig, SyncMode};
pub use error::{SyncError, SyncResult};
pub use memory::MemoryRemote;
pub use reconciler::{
    Anomaly, CycleReport, FetchFailure, Phase, PullStats, PushStats, RecordFailure, Reconciler,
};
pub use remote::{
    CalendarPayload, ChangeSet, EventPayload, RemoteEntity, RemoteRecord, RemoteStore,
    TimedRemote, UpdateOutcome,
};
