//! # Outbox (Push Phase)
//!
//! Sends every unsynced local row to the remote.
//!
//! ## Per-Record Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Push One Record                                │
//! │                                                                         │
//! │  query_unsynced()  (calendars first, then events)                      │
//! │       │                                                                 │
//! │       ├─ live, no sync_id ──► create_remote ──► bind_sync_id ─┐        │
//! │       │                                                        │        │
//! │       ├─ live, sync_id ─────► update_remote ─┬─ Applied ──────┤        │
//! │       │                                      └─ Conflict: stays        │
//! │       │                                         unsynced, pull decides,│
//! │       │                                         settled after the pull │
//! │       ├─ tombstone, sync_id ► delete_remote ──────────────────┤        │
//! │       │                                                        ▼        │
//! │       │                        mark_synced_if_unchanged(observed rev)  │
//! │       │                                                                 │
//! │       └─ tombstone, no sync_id ► skipped (never left the device)       │
//! │                                                                         │
//! │  Error on any step ──► sync_failures.attempts += 1, next record        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A push is a snapshot: the row is read once and acknowledged only if it
//! still carries the revision that was sent. An edit made while the request
//! was in flight keeps the row unsynced for the next cycle.
//!
//! A conflict is booked as a failure only if the pull that follows leaves
//! the row unsynced, so a remote that keeps rejecting a record surfaces
//! through the failure table like any other error.

use calsync_core::{Calendar, EntityKind, Event, SyncEntity, SyncEvent};
use calsync_db::{Database, DbResult, Record};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{CycleReport, Phase, RecordFailure};
use crate::remote::{CalendarPayload, EventPayload, RemoteEntity, TimedRemote, UpdateOutcome};

/// What happened to one pushed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    /// `acked` is false when the row changed while the request was in flight.
    Created { acked: bool },
    Updated { acked: bool },
    Deleted { acked: bool },
    Conflict,
    Skipped,
}

/// An update the remote rejected as older.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Conflicted {
    kind: EntityKind,
    id: String,
    sync_id: String,
}

/// The push phase of one cycle.
pub(crate) struct Outbox<'a> {
    db: &'a Database,
    remote: &'a TimedRemote,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(db: &'a Database, remote: &'a TimedRemote) -> Self {
        Outbox { db, remote }
    }

    /// Pushes every unsynced calendar, then every unsynced event.
    ///
    /// Returns the rejected updates; hand them to
    /// [`settle_conflicts`](Self::settle_conflicts) once the pull ran.
    ///
    /// ## Errors
    /// Only when the unsynced rows cannot be read. Per-record failures are
    /// recorded in `report` and do not stop the phase.
    pub(crate) async fn push(&self, report: &mut CycleReport) -> SyncResult<Vec<Conflicted>> {
        let mut conflicts = Vec::new();

        let calendars = self.db.calendars().query_unsynced().await?;
        if !calendars.is_empty() {
            info!(count = calendars.len(), "Pushing calendars");
        }
        for calendar in &calendars {
            let result = self.push_calendar(calendar).await;
            conflicts.extend(self.settle(calendar, result, report).await);
        }

        // Read after the calendars went out so their fresh sync ids resolve.
        let events = self.db.events().query_unsynced().await?;
        if !events.is_empty() {
            info!(count = events.len(), "Pushing events");
        }
        for event in &events {
            let result = self.push_event(event).await;
            conflicts.extend(self.settle(event, result, report).await);
        }

        Ok(conflicts)
    }

    /// Books every conflict the pull did not resolve as a failed attempt,
    /// and clears the count of those it did.
    pub(crate) async fn settle_conflicts(&self, conflicts: Vec<Conflicted>, report: &mut CycleReport) {
        let state = self.db.sync_state();

        for Conflicted { kind, id, sync_id } in conflicts {
            let pending = match kind {
                EntityKind::Calendar => self.still_pending::<Calendar>(&id).await,
                EntityKind::Event => self.still_pending::<Event>(&id).await,
            };
            let pending = match pending {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(%kind, id = %id, error = %e, "Could not check conflicted record");
                    continue;
                }
            };

            if !pending {
                if let Err(e) = state.clear_failure(kind, &id).await {
                    warn!(id = %id, error = %e, "Could not clear failure count");
                }
                continue;
            }

            let err = SyncError::RemoteConflict { kind, sync_id };
            let attempts = state
                .record_failure(kind, &id, &err.to_string())
                .await
                .unwrap_or_else(|e| {
                    warn!(id = %id, error = %e, "Could not record conflict");
                    0
                });
            warn!(%kind, id = %id, attempts, error = %err, "Conflict not resolved by pull");
            report.failures.push(RecordFailure {
                phase: Phase::Push,
                kind,
                id,
                error: err.to_string(),
                retryable: err.is_retryable(),
                attempts,
            });
        }
    }

    /// The row exists and is still waiting to be pushed.
    async fn still_pending<T: Record>(&self, id: &str) -> DbResult<bool> {
        let row = self.db.repository::<T>().get_by_id(id).await?;
        Ok(row.is_some_and(|r| !r.is_synced()))
    }

    async fn push_calendar(&self, calendar: &Calendar) -> SyncResult<Pushed> {
        if calendar.is_deleted() {
            return self.push_tombstone(calendar).await;
        }
        let payload = RemoteEntity::Calendar(CalendarPayload::from_calendar(calendar));
        self.push_upsert(calendar, &payload).await
    }

    async fn push_event(&self, event: &Event) -> SyncResult<Pushed> {
        if event.is_deleted() {
            return self.push_tombstone(event).await;
        }
        let calendar_ref = self.calendar_ref(event).await?;
        let payload = RemoteEntity::Event(EventPayload::from_event(event, calendar_ref));
        self.push_upsert(event, &payload).await
    }

    /// Remote id of the event's calendar.
    ///
    /// ## Errors
    /// [`SyncError::CalendarNotSynced`] while the calendar has no `sync_id`.
    async fn calendar_ref(&self, event: &Event) -> SyncResult<String> {
        match self.db.calendars().get_by_id(&event.calendar_id).await? {
            Some(calendar) => calendar
                .meta
                .sync_id
                .ok_or_else(|| SyncError::CalendarNotSynced {
                    calendar_id: event.calendar_id.clone(),
                }),
            // Not a local id: a remote reference kept from a pull, sent back as is.
            None => Ok(event.calendar_id.clone()),
        }
    }

    async fn push_upsert<T: Record>(&self, record: &T, payload: &RemoteEntity) -> SyncResult<Pushed> {
        let repo = self.db.repository::<T>();
        let observed = record.updated_at();
        let pending = record.sync_state().apply(SyncEvent::PushStarted)?;

        let pushed = match record.sync_id() {
            None => {
                let sync_id = self.remote.create_remote(payload, observed).await?;
                repo.bind_sync_id(record.id(), &sync_id).await?;
                debug!(kind = %T::KIND, id = %record.id(), sync_id = %sync_id, "Created on remote");
                Pushed::Created {
                    acked: repo.mark_synced_if_unchanged(record.id(), observed).await?,
                }
            }
            Some(sync_id) => match self.remote.update_remote(sync_id, payload, observed).await? {
                UpdateOutcome::Applied => Pushed::Updated {
                    acked: repo.mark_synced_if_unchanged(record.id(), observed).await?,
                },
                UpdateOutcome::Conflict => return Ok(Pushed::Conflict),
            },
        };

        if let Pushed::Created { acked: true } | Pushed::Updated { acked: true } = pushed {
            let next = pending.apply(SyncEvent::PushAcknowledged)?;
            debug!(kind = %T::KIND, id = %record.id(), from = %pending, to = %next, "Push acknowledged");
        }
        Ok(pushed)
    }

    async fn push_tombstone<T: Record>(&self, record: &T) -> SyncResult<Pushed> {
        let Some(sync_id) = record.sync_id() else {
            debug!(kind = %T::KIND, id = %record.id(), "Tombstone never reached the remote");
            return Ok(Pushed::Skipped);
        };

        record.sync_state().apply(SyncEvent::PushStarted)?;
        self.remote.delete_remote(T::KIND, sync_id).await?;

        let acked = self
            .db
            .repository::<T>()
            .mark_synced_if_unchanged(record.id(), record.updated_at())
            .await?;
        debug!(kind = %T::KIND, id = %record.id(), sync_id, acked, "Deleted on remote");
        Ok(Pushed::Deleted { acked })
    }

    /// Books the outcome of one record into `report` and the failure table.
    async fn settle<T: Record>(
        &self,
        record: &T,
        result: SyncResult<Pushed>,
        report: &mut CycleReport,
    ) -> Option<Conflicted> {
        let state = self.db.sync_state();

        let pushed = match result {
            Ok(pushed) => pushed,
            Err(err) => {
                report.push.failed += 1;
                if record.is_deleted() {
                    report.push.tombstone_failures += 1;
                }

                let attempts = state
                    .record_failure(T::KIND, record.id(), &err.to_string())
                    .await
                    .unwrap_or_else(|e| {
                        warn!(id = %record.id(), error = %e, "Could not record push failure");
                        0
                    });
                warn!(
                    kind = %T::KIND,
                    id = %record.id(),
                    attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Push failed"
                );
                report.failures.push(RecordFailure {
                    phase: Phase::Push,
                    kind: T::KIND,
                    id: record.id().to_string(),
                    error: err.to_string(),
                    retryable: err.is_retryable(),
                    attempts,
                });
                return None;
            }
        };

        let acked = match pushed {
            Pushed::Created { acked } => {
                report.push.created += 1;
                acked
            }
            Pushed::Updated { acked } => {
                report.push.updated += 1;
                acked
            }
            Pushed::Deleted { acked } => {
                report.push.deleted += 1;
                acked
            }
            Pushed::Skipped => {
                report.push.skipped += 1;
                true
            }
            Pushed::Conflict => {
                report.push.conflicts += 1;
                let sync_id = record.sync_id().unwrap_or_default().to_string();
                debug!(
                    kind = %T::KIND,
                    id = %record.id(),
                    sync_id = %sync_id,
                    "Push rejected, pull will resolve"
                );
                return Some(Conflicted {
                    kind: T::KIND,
                    id: record.id().to_string(),
                    sync_id,
                });
            }
        };

        if !acked {
            report.push.unconfirmed += 1;
            debug!(kind = %T::KIND, id = %record.id(), "Edited during push, stays unsynced");
        }
        if let Err(e) = state.clear_failure(T::KIND, record.id()).await {
            warn!(id = %record.id(), error = %e, "Could not clear failure count");
        }
        None
    }
}
