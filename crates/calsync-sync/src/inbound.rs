//! # Inbound (Pull Phase)
//!
//! Applies remote changes to the local store with last-writer-wins.
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Apply One RemoteRecord (looked up by sync_id)           │
//! │                                                                         │
//! │  Not stored locally                                                    │
//! │    ├─ remote deleted ─────────────► ignore                             │
//! │    └─ otherwise ──────────────────► insert (fresh id, synced)          │
//! │                                                                         │
//! │  Stored, remote.updated_at > local.updated_at  (remote wins)           │
//! │    ├─ same content ───────────────► mark synced only, no revision bump │
//! │    ├─ remote deleted ─────────────► tombstone at remote revision       │
//! │    └─ otherwise ──────────────────► overwrite content + revision       │
//! │                                                                         │
//! │  Stored, remote.updated_at <= local.updated_at  (local wins ties)      │
//! │    ├─ local synced, content differs ► mark unsynced (push again)       │
//! │    └─ otherwise ──────────────────► keep local                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every local write is conditional on the revision read at the start of the
//! decision. If the user edited the row in between, nothing is written and
//! the batch is treated as incomplete so the cursor does not advance.
//!
//! A pulled primary calendar demotes the local one. If the batch leaves the
//! device with no primary at all, the oldest live calendar is promoted.

use calsync_core::{generate_id, EntityKind, SyncEvent};
use calsync_db::{Database, DbError, Record};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{Anomaly, CycleReport, FetchFailure, Phase, PullStats, RecordFailure};
use crate::remote::{ChangeSet, RemoteEntity, RemoteRecord, TimedRemote};

/// What happened to one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulled {
    Inserted,
    Overwritten,
    Deleted,
    /// Same content; only the sync flag was set.
    Confirmed,
    Unchanged,
    LocalWins,
    /// Local won but was marked synced with different content; queued for push.
    Requeued,
    Ignored,
    /// The local row changed during the decision; nothing written.
    Stale,
}

/// The pull phase of one cycle.
pub(crate) struct Inbound<'a> {
    db: &'a Database,
    remote: &'a TimedRemote,
    scope: &'a str,
}

impl<'a> Inbound<'a> {
    pub(crate) fn new(db: &'a Database, remote: &'a TimedRemote, scope: &'a str) -> Self {
        Inbound { db, remote, scope }
    }

    /// Fetches changes since the stored cursor and applies them.
    ///
    /// A failed fetch is recorded in `report.pull.fetch_error`; a cursor the
    /// remote rejects is dropped so the next pull starts over.
    ///
    /// ## Errors
    /// When the local store cannot be read. Per-record failures are recorded
    /// in `report`.
    pub(crate) async fn pull(&self, report: &mut CycleReport) -> SyncResult<()> {
        let state = self.db.sync_state();
        let cursor = state.get_cursor(self.scope).await?;

        let ChangeSet {
            mut records,
            cursor: next_cursor,
        } = match self.remote.fetch_changes_since(cursor.as_deref()).await {
            Ok(changes) => changes,
            Err(err) => {
                self.fetch_failed(err, report).await;
                return Ok(());
            }
        };
        report.pull.fetched = records.len();
        if !records.is_empty() {
            info!(count = records.len(), cursor = ?cursor, "Applying remote changes");
        }

        // Calendars first so event references resolve. Stable within a kind.
        records.sort_by_key(|r| r.kind() != EntityKind::Calendar);
        let had_primary = records.iter().any(|r| r.kind() == EntityKind::Calendar)
            && self.db.calendars().get_primary().await?.is_some();

        let mut complete = true;
        for record in &records {
            match self.apply(record).await {
                Ok(pulled) => {
                    if pulled == Pulled::Stale {
                        complete = false;
                    }
                    tally(&mut report.pull, pulled);
                }
                Err(err) => {
                    complete = false;
                    report.pull.failed += 1;
                    self.book_failure(record, err, report);
                }
            }
        }

        if had_primary {
            self.keep_primary(report).await;
        }

        if !complete {
            info!(cursor = ?cursor, "Pull incomplete, cursor kept for retry");
            return Ok(());
        }
        if cursor.as_deref() != Some(next_cursor.as_str()) {
            // Losing the cursor only means re-fetching; application is idempotent.
            if let Err(e) = state.save_cursor(self.scope, &next_cursor).await {
                warn!(error = %e, "Could not save cursor");
                return Ok(());
            }
        }
        report.cursor = Some(next_cursor);
        Ok(())
    }

    async fn fetch_failed(&self, err: SyncError, report: &mut CycleReport) {
        warn!(error = %err, retryable = err.is_retryable(), "Could not fetch remote changes");

        if let SyncError::InvalidCursor(_) = err {
            match self.db.sync_state().clear_cursor(self.scope).await {
                Ok(()) => info!(scope = self.scope, "Rejected cursor dropped, next pull starts over"),
                Err(e) => warn!(error = %e, "Could not drop rejected cursor"),
            }
        }

        report.pull.fetch_error = Some(FetchFailure {
            error: err.to_string(),
            retryable: err.is_retryable(),
        });
    }

    /// Hands primacy to the oldest calendar if this pull demoted the last one.
    async fn keep_primary(&self, report: &mut CycleReport) {
        match self.db.calendars().restore_primary().await {
            Ok(Some(id)) => {
                info!(id = %id, "Pull left no primary calendar, oldest promoted");
                report.pull.primary_restored = true;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not restore primary calendar"),
        }
    }

    fn book_failure(&self, record: &RemoteRecord, err: SyncError, report: &mut CycleReport) {
        warn!(
            kind = %record.kind(),
            sync_id = %record.sync_id,
            retryable = err.is_retryable(),
            error = %err,
            "Remote change not applied"
        );

        if let SyncError::Database(DbError::ConstraintViolation { field, .. }) = &err {
            if field == "sync_id" {
                report.anomalies.push(Anomaly::DuplicateSyncId {
                    kind: record.kind(),
                    sync_id: record.sync_id.clone(),
                });
            }
        }

        report.failures.push(RecordFailure {
            phase: Phase::Pull,
            kind: record.kind(),
            id: record.sync_id.clone(),
            error: err.to_string(),
            retryable: err.is_retryable(),
            attempts: 0,
        });
    }

    async fn apply(&self, record: &RemoteRecord) -> SyncResult<Pulled> {
        match &record.entity {
            RemoteEntity::Calendar(payload) => {
                let incoming = payload.clone().into_calendar(record.meta_for(generate_id()));
                self.apply_record(record, incoming).await
            }
            RemoteEntity::Event(payload) => {
                let calendar_id = self.local_calendar_id(&payload.calendar_id).await?;
                let incoming = payload
                    .clone()
                    .into_event(record.meta_for(generate_id()), calendar_id);
                self.apply_record(record, incoming).await
            }
        }
    }

    /// Local id of the calendar with remote id `calendar_ref`. Unknown
    /// references are kept verbatim; the integrity scan reports them.
    async fn local_calendar_id(&self, calendar_ref: &str) -> SyncResult<String> {
        match self.db.calendars().get_by_sync_id(calendar_ref).await? {
            Some(calendar) => Ok(calendar.meta.id),
            None => {
                debug!(calendar_ref, "Pulled event references an unknown calendar");
                Ok(calendar_ref.to_string())
            }
        }
    }

    async fn apply_record<T: Record>(&self, record: &RemoteRecord, incoming: T) -> SyncResult<Pulled> {
        let repo = self.db.repository::<T>();

        let Some(local) = repo.get_by_sync_id(&record.sync_id).await? else {
            if record.deleted {
                debug!(kind = %T::KIND, sync_id = %record.sync_id, "Deletion of unknown record ignored");
                return Ok(Pulled::Ignored);
            }
            repo.insert(&incoming).await?;
            debug!(kind = %T::KIND, id = %incoming.id(), sync_id = %record.sync_id, "Inserted from remote");
            return Ok(Pulled::Inserted);
        };
        let observed = local.updated_at();

        if record.updated_at <= observed {
            if local.is_synced() && !local.content_eq(&incoming) {
                repo.mark_unsynced(&record.sync_id).await?;
                debug!(kind = %T::KIND, id = %local.id(), "Local wins over differing remote, re-queued");
                return Ok(Pulled::Requeued);
            }
            return Ok(Pulled::LocalWins);
        }

        let event = if record.deleted {
            SyncEvent::PullDeleted
        } else {
            SyncEvent::PullApplied
        };
        let next = local.sync_state().apply(event)?;

        let pulled = if local.content_eq(&incoming) {
            if local.is_synced() {
                return Ok(Pulled::Unchanged);
            }
            if repo.mark_synced_if_unchanged(local.id(), observed).await? {
                Pulled::Confirmed
            } else {
                Pulled::Stale
            }
        } else if record.deleted {
            if repo
                .apply_remote_tombstone(local.id(), observed, record.updated_at)
                .await?
            {
                Pulled::Deleted
            } else {
                Pulled::Stale
            }
        } else {
            let mut merged = local.clone();
            merged.copy_content_from(&incoming);
            merged.meta_mut().updated_at = record.updated_at;
            merged.meta_mut().is_synced = true;
            if repo.replace_if_unchanged(&merged, observed).await? {
                Pulled::Overwritten
            } else {
                Pulled::Stale
            }
        };

        if pulled == Pulled::Stale {
            debug!(kind = %T::KIND, id = %local.id(), "Row changed while applying, skipped");
        } else {
            debug!(
                kind = %T::KIND,
                id = %local.id(),
                from = %local.sync_state(),
                to = %next,
                outcome = ?pulled,
                "Remote change applied"
            );
        }
        Ok(pulled)
    }
}

fn tally(stats: &mut PullStats, pulled: Pulled) {
    match pulled {
        Pulled::Inserted => stats.inserted += 1,
        Pulled::Overwritten => stats.overwritten += 1,
        Pulled::Deleted => stats.deleted += 1,
        Pulled::Confirmed => stats.confirmed += 1,
        Pulled::Unchanged => stats.unchanged += 1,
        Pulled::LocalWins => stats.local_wins += 1,
        Pulled::Requeued => stats.requeued += 1,
        Pulled::Ignored => stats.ignored += 1,
        Pulled::Stale => stats.stale += 1,
    }
}
