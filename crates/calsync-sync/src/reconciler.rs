//! # Reconciler
//!
//! Runs one reconciliation cycle between the local store and the remote.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           run_cycle()                                   │
//! │                                                                         │
//! │  try_lock ──(busy)──► Err(CycleInProgress), no remote calls            │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  1. Push     Outbox: unsynced calendars, then unsynced events          │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  2. Pull     Inbound: changes since cursor, LWW, cursor saved if all   │
//! │     │        records applied; a failed fetch is reported, not raised   │
//! │     ▼                                                                   │
//! │     Conflicts the pull left unsynced count as failed attempts          │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  3. Sweep    purge confirmed tombstones older than retention           │
//! │     │        (skipped if a tombstone push failed this cycle)           │
//! │     ▼                                                                   │
//! │  4. Scan     relink event → calendar refs, report dangling events and  │
//! │              records that exhausted their attempts                     │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  CycleReport                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every remote call is bounded by `sync.request_timeout_secs`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use calsync_core::{clock, EntityKind};
use calsync_db::{Database, DEFAULT_SCOPE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::inbound::Inbound;
use crate::outbox::Outbox;
use crate::remote::{RemoteStore, TimedRemote};

// =============================================================================
// Cycle Report
// =============================================================================

/// Push phase counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Tombstones that never had a remote id.
    pub skipped: usize,
    /// Updates the remote rejected as older; resolved by the pull phase.
    pub conflicts: usize,
    /// Pushed, but edited while in flight; still unsynced.
    pub unconfirmed: usize,
    pub failed: usize,
    /// Failed pushes of tombstones. Any of these skips the sweep.
    pub tombstone_failures: usize,
}

impl PushStats {
    pub fn pushed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Pull phase counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullStats {
    pub fetched: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub deleted: usize,
    /// Remote newer but identical; only the sync flag was set.
    pub confirmed: usize,
    pub unchanged: usize,
    pub local_wins: usize,
    /// Local won against differing remote content and was queued for push.
    pub requeued: usize,
    /// Deletions of records this device never had.
    pub ignored: usize,
    /// Skipped because the row was edited during the pull.
    pub stale: usize,
    pub failed: usize,
    /// The pull demoted the last primary calendar and the oldest was promoted.
    pub primary_restored: bool,
    /// Set when the change feed could not be fetched; nothing was applied.
    pub fetch_error: Option<FetchFailure>,
}

/// Why the change feed could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub error: String,
    pub retryable: bool,
}

impl PullStats {
    pub fn applied(&self) -> usize {
        self.inserted + self.overwritten + self.deleted + self.confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Push,
    Pull,
}

/// One record that could not be synced this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub phase: Phase,
    pub kind: EntityKind,
    /// Local id for pushes, remote id for pulls.
    pub id: String,
    pub error: String,
    pub retryable: bool,
    /// Consecutive failures so far (pushes only; 0 for pulls).
    pub attempts: i64,
}

/// Data problems found during a cycle. Reported, never auto-repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    /// A live event whose calendar is missing or deleted.
    DanglingCalendar { event_id: String, calendar_id: String },
    /// A pulled record whose remote id is already held by another row.
    DuplicateSyncId { kind: EntityKind, sync_id: String },
    /// A record that failed at least `max_attempts` times in a row. It is
    /// still retried every cycle.
    ExhaustedRetries {
        kind: EntityKind,
        id: String,
        attempts: i64,
        last_error: Option<String>,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::DanglingCalendar { event_id, calendar_id } => {
                write!(f, "event {} references missing calendar {}", event_id, calendar_id)
            }
            Anomaly::DuplicateSyncId { kind, sync_id } => {
                write!(f, "{} sync_id {} is already taken", kind, sync_id)
            }
            Anomaly::ExhaustedRetries { kind, id, attempts, .. } => {
                write!(f, "{} {} failed {} times", kind, id, attempts)
            }
        }
    }
}

/// Outcome of one [`Reconciler::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub push: PushStats,
    pub pull: PullStats,
    /// Tombstones removed by the retention sweep.
    pub purged: u64,
    pub sweep_skipped: bool,
    /// Cursor saved this cycle; `None` if the pull was incomplete.
    pub cursor: Option<String>,
    pub failures: Vec<RecordFailure>,
    pub anomalies: Vec<Anomaly>,
}

impl CycleReport {
    /// No record failed and the change feed was fetched.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.pull.fetch_error.is_none()
    }

    /// At least one failure is worth retrying soon.
    pub fn has_transient_failures(&self) -> bool {
        self.failures.iter().any(|f| f.retryable)
            || self.pull.fetch_error.as_ref().is_some_and(|f| f.retryable)
    }

    pub fn exhausted(&self) -> impl Iterator<Item = &Anomaly> {
        self.anomalies
            .iter()
            .filter(|a| matches!(a, Anomaly::ExhaustedRetries { .. }))
    }

    fn log(&self) {
        info!(
            pushed = self.push.pushed(),
            conflicts = self.push.conflicts,
            pulled = self.pull.applied(),
            failed = self.failures.len(),
            purged = self.purged,
            anomalies = self.anomalies.len(),
            duration_ms = self.duration_ms,
            "Sync cycle finished"
        );
        if let Some(fetch) = &self.pull.fetch_error {
            warn!(error = %fetch.error, retryable = fetch.retryable, "Pull skipped this cycle");
        }
        for anomaly in &self.anomalies {
            warn!(%anomaly, "Integrity anomaly");
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {} (created {}, updated {}, deleted {}), conflicts {}, \
             pulled {} of {} fetched, failed {}, purged {}, anomalies {}",
            self.push.pushed(),
            self.push.created,
            self.push.updated,
            self.push.deleted,
            self.push.conflicts,
            self.pull.applied(),
            self.pull.fetched,
            self.failures.len(),
            self.purged,
            self.anomalies.len()
        )?;
        if let Some(fetch) = &self.pull.fetch_error {
            write!(f, ", pull failed: {}", fetch.error)?;
        }
        Ok(())
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles one local store with one remote.
///
/// Holds no state between cycles besides what is persisted in the store
/// (cursor, failure counts), so a restart resumes where it stopped.
///
/// ## Example
/// ```rust,ignore
/// let reconciler = Reconciler::new(db, Arc::new(MemoryRemote::new()), config);
/// let report = reconciler.run_cycle().await?;
/// println!("{}", report);
/// ```
pub struct Reconciler {
    db: Arc<Database>,
    remote: TimedRemote,
    config: Arc<SyncConfig>,
    scope: String,
    gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteStore>, config: Arc<SyncConfig>) -> Self {
        let remote = TimedRemote::new(remote, config.request_timeout());
        Reconciler {
            db,
            remote,
            config,
            scope: DEFAULT_SCOPE.to_string(),
            gate: Mutex::new(()),
        }
    }

    /// Overrides the per-call timeout (finer than the config's seconds).
    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.remote = TimedRemote::new(self.remote_inner(), limit);
        self
    }

    /// Stores the cursor under `scope` instead of the default one.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn remote_inner(&self) -> Arc<dyn RemoteStore> {
        self.remote.inner()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs push, pull, sweep and scan once.
    ///
    /// ## Errors
    /// - [`SyncError::CycleInProgress`] if another cycle holds the gate
    /// - the local store cannot be read
    ///
    /// Remote problems never fail the cycle: per-record failures and a
    /// failed fetch are in the report.
    #[instrument(skip(self), fields(device = %self.config.device_id()))]
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let _gate = self.gate.try_lock().map_err(|_| {
            debug!("Cycle requested while another is running");
            SyncError::CycleInProgress
        })?;

        let started = Instant::now();
        let mut report = CycleReport {
            started_at: clock::now(),
            ..CycleReport::default()
        };
        info!("Sync cycle started");

        let outbox = Outbox::new(&self.db, &self.remote);
        let conflicts = outbox.push(&mut report).await?;
        Inbound::new(&self.db, &self.remote, &self.scope)
            .pull(&mut report)
            .await?;
        outbox.settle_conflicts(conflicts, &mut report).await;
        self.sweep_tombstones(&mut report).await;
        self.scan(&mut report).await;

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report.log();
        Ok(report)
    }

    async fn sweep_tombstones(&self, report: &mut CycleReport) {
        if report.push.tombstone_failures > 0 {
            info!(
                failures = report.push.tombstone_failures,
                "Tombstone push failed, retention sweep skipped"
            );
            report.sweep_skipped = true;
            return;
        }
        match self.sweep(clock::now()).await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }

    /// Purges tombstones older than the retention window as seen at `now`.
    ///
    /// Only rows the remote confirmed, or that never reached it, are removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let cutoff = now - self.config.tombstone_retention();
        let calendars = self.db.calendars().purge_tombstones_older_than(cutoff).await?;
        let events = self.db.events().purge_tombstones_older_than(cutoff).await?;
        let pruned = self.db.sync_state().prune_failures().await?;

        if calendars + events > 0 {
            info!(calendars, events, pruned, %cutoff, "Tombstones purged");
        }
        Ok(calendars + events)
    }

    async fn scan(&self, report: &mut CycleReport) {
        match self.integrity_scan().await {
            Ok(found) => report.anomalies.extend(found),
            Err(e) => warn!(error = %e, "Integrity scan failed"),
        }
    }

    /// Relinks event calendar references, then lists dangling events and
    /// records that reached `max_attempts`.
    pub async fn integrity_scan(&self) -> SyncResult<Vec<Anomaly>> {
        let events = self.db.events();
        events.relink_calendar_refs().await?;

        let mut anomalies: Vec<Anomaly> = events
            .find_dangling()
            .await?
            .into_iter()
            .map(|event| Anomaly::DanglingCalendar {
                event_id: event.meta.id,
                calendar_id: event.calendar_id,
            })
            .collect();

        let exhausted = self
            .db
            .sync_state()
            .failures_at_least(i64::from(self.config.sync.max_attempts))
            .await?;
        anomalies.extend(exhausted.into_iter().map(|f| Anomaly::ExhaustedRetries {
            kind: f.kind,
            id: f.entity_id,
            attempts: f.attempts,
            last_error: f.last_error,
        }));

        Ok(anomalies)
    }

    /// Rows waiting to be pushed.
    pub async fn pending_count(&self) -> SyncResult<i64> {
        let calendars = self.db.calendars().count_unsynced().await?;
        let events = self.db.events().count_unsynced().await?;
        Ok(calendars + events)
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("remote", &self.remote)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
