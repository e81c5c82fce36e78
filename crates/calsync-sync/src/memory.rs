//! # In-Memory Remote
//!
//! A [`RemoteStore`] that keeps documents as JSON in process memory, with a
//! sequence-numbered change feed and fault injection. Tests and the demo
//! binary sync against it.
//!
//! ## Change Feed
//! Every write stamps the document with the next sequence number. The cursor
//! is the last sequence number handed out, so `fetch_changes_since(c)`
//! returns the latest state of every document written after `c`.
//!
//! ## Fault Injection
//! - `set_offline(true)`: every call fails with `TransientNetworkFailure`
//! - `set_latency(d)`: every call sleeps `d` first (pair with a short
//!   request timeout to produce `Timeout`)
//! - `force_conflict(sync_id)`: the next update of that document conflicts
//! - `fail_sync_id(sync_id)`: updates and deletes of that document fail
//!   until `heal_sync_id` is called

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use calsync_core::{clock, EntityKind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::remote::{ChangeSet, RemoteEntity, RemoteRecord, RemoteStore, UpdateOutcome};

#[derive(Debug, Clone)]
struct Document {
    kind: EntityKind,
    updated_at: DateTime<Utc>,
    deleted: bool,
    body: Value,
    seq: u64,
}

/// Calls received, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub fetch: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.create + self.update + self.delete + self.fetch
    }
}

#[derive(Debug, Default)]
struct State {
    docs: HashMap<String, Document>,
    seq: u64,
    offline: bool,
    latency: Option<Duration>,
    forced_conflicts: HashSet<String>,
    failing: HashSet<String>,
    calls: CallCounts,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.offline {
            return Err(SyncError::TransientNetworkFailure("remote is offline".into()));
        }
        Ok(())
    }

    fn check_document(&self, sync_id: &str) -> SyncResult<()> {
        if self.failing.contains(sync_id) {
            return Err(SyncError::TransientNetworkFailure(format!(
                "remote rejected {} (injected)",
                sync_id
            )));
        }
        Ok(())
    }
}

/// In-process remote store.
///
/// ## Example
/// ```rust,ignore
/// let remote = Arc::new(MemoryRemote::new());
/// let reconciler = Reconciler::new(db, remote.clone(), config);
///
/// remote.set_offline(true).await;
/// let report = reconciler.run_cycle().await?; // report.pull.fetch_error is set
/// ```
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Makes the next `update_remote` of `sync_id` return `Conflict`.
    pub async fn force_conflict(&self, sync_id: &str) {
        self.state.lock().await.forced_conflicts.insert(sync_id.to_string());
    }

    /// Makes every update and delete of `sync_id` fail until healed.
    pub async fn fail_sync_id(&self, sync_id: &str) {
        self.state.lock().await.failing.insert(sync_id.to_string());
    }

    pub async fn heal_sync_id(&self, sync_id: &str) {
        self.state.lock().await.failing.remove(sync_id);
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    // -------------------------------------------------------------------------
    // Inspection and writes from "other devices"
    // -------------------------------------------------------------------------

    /// Current state of one document.
    pub async fn get(&self, sync_id: &str) -> SyncResult<Option<RemoteRecord>> {
        let state = self.state.lock().await;
        state
            .docs
            .get(sync_id)
            .map(|doc| to_record(sync_id, doc))
            .transpose()
    }

    /// Number of documents, tombstones included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Writes a document as another device would, bypassing conflict checks
    /// and fault injection. Returns its sync id (generated when `None`).
    pub async fn put(
        &self,
        sync_id: Option<&str>,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
        deleted: bool,
    ) -> SyncResult<String> {
        let body = serde_json::to_value(entity)?;
        let sync_id = sync_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        state.docs.insert(
            sync_id.clone(),
            Document {
                kind: entity.kind(),
                updated_at,
                deleted,
                body,
                seq,
            },
        );
        Ok(sync_id)
    }

    /// Simulated network latency, outside the lock.
    async fn enter(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn to_record(sync_id: &str, doc: &Document) -> SyncResult<RemoteRecord> {
    let entity: RemoteEntity = serde_json::from_value(doc.body.clone())?;
    Ok(RemoteRecord {
        sync_id: sync_id.to_string(),
        updated_at: doc.updated_at,
        deleted: doc.deleted,
        entity,
    })
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn create_remote(
        &self,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<String> {
        self.enter().await;
        let body = serde_json::to_value(entity)?;

        let mut state = self.state.lock().await;
        state.calls.create += 1;
        state.check_reachable()?;

        let sync_id = Uuid::new_v4().to_string();
        let seq = state.next_seq();
        state.docs.insert(
            sync_id.clone(),
            Document {
                kind: entity.kind(),
                updated_at,
                deleted: false,
                body,
                seq,
            },
        );

        debug!(kind = %entity.kind(), sync_id = %sync_id, seq, "Remote document created");
        Ok(sync_id)
    }

    async fn update_remote(
        &self,
        sync_id: &str,
        entity: &RemoteEntity,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<UpdateOutcome> {
        self.enter().await;
        let body = serde_json::to_value(entity)?;

        let mut state = self.state.lock().await;
        state.calls.update += 1;
        state.check_reachable()?;
        state.check_document(sync_id)?;

        if state.forced_conflicts.remove(sync_id) {
            return Ok(UpdateOutcome::Conflict);
        }
        if let Some(existing) = state.docs.get(sync_id) {
            if existing.updated_at > updated_at {
                return Ok(UpdateOutcome::Conflict);
            }
        }

        // Unknown ids are stored as given so a retried update is never lost.
        let seq = state.next_seq();
        state.docs.insert(
            sync_id.to_string(),
            Document {
                kind: entity.kind(),
                updated_at,
                deleted: false,
                body,
                seq,
            },
        );

        debug!(sync_id, seq, "Remote document updated");
        Ok(UpdateOutcome::Applied)
    }

    async fn delete_remote(&self, kind: EntityKind, sync_id: &str) -> SyncResult<()> {
        self.enter().await;

        let mut state = self.state.lock().await;
        state.calls.delete += 1;
        state.check_reachable()?;
        state.check_document(sync_id)?;

        let already_deleted = match state.docs.get(sync_id) {
            None => {
                debug!(%kind, sync_id, "Delete of unknown remote document ignored");
                return Ok(());
            }
            Some(doc) if doc.kind != kind => {
                return Err(SyncError::Internal(format!(
                    "{} is a {}, not a {}",
                    sync_id, doc.kind, kind
                )));
            }
            Some(doc) => doc.deleted,
        };
        if already_deleted {
            return Ok(());
        }

        let seq = state.next_seq();
        if let Some(doc) = state.docs.get_mut(sync_id) {
            doc.deleted = true;
            doc.updated_at = clock::next_revision(doc.updated_at);
            doc.seq = seq;
        }

        debug!(%kind, sync_id, seq, "Remote document deleted");
        Ok(())
    }

    async fn fetch_changes_since(&self, cursor: Option<&str>) -> SyncResult<ChangeSet> {
        self.enter().await;

        let mut state = self.state.lock().await;
        state.calls.fetch += 1;
        state.check_reachable()?;

        let since = match cursor {
            None => 0,
            Some(c) => c
                .parse::<u64>()
                .map_err(|_| SyncError::InvalidCursor(c.to_string()))?,
        };

        let mut changed: Vec<(&String, &Document)> =
            state.docs.iter().filter(|(_, doc)| doc.seq > since).collect();
        changed.sort_by_key(|(_, doc)| doc.seq);

        let records = changed
            .into_iter()
            .map(|(sync_id, doc)| to_record(sync_id, doc))
            .collect::<SyncResult<Vec<_>>>()?;

        debug!(since, count = records.len(), "Remote changes fetched");
        Ok(ChangeSet {
            records,
            cursor: state.seq.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CalendarPayload;
    use calsync_core::{Calendar, CalendarType};
    use chrono::Duration as ChronoDuration;

    fn work() -> RemoteEntity {
        let cal = Calendar::with_default_color("Work", CalendarType::Local).unwrap();
        RemoteEntity::Calendar(CalendarPayload::from_calendar(&cal))
    }

    #[tokio::test]
    async fn test_change_feed_returns_latest_state_after_cursor() {
        let remote = MemoryRemote::new();
        let t0 = clock::now();

        let a = remote.create_remote(&work(), t0).await.unwrap();
        let first = remote.fetch_changes_since(None).await.unwrap();
        assert_eq!(first.records.len(), 1);

        let b = remote.create_remote(&work(), t0).await.unwrap();
        remote
            .update_remote(&a, &work(), t0 + ChronoDuration::seconds(1))
            .await
            .unwrap();

        let next = remote.fetch_changes_since(Some(&first.cursor)).await.unwrap();
        let ids: Vec<_> = next.records.iter().map(|r| r.sync_id.clone()).collect();
        assert_eq!(ids, vec![b, a]);

        let empty = remote.fetch_changes_since(Some(&next.cursor)).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.cursor, next.cursor);
    }

    #[tokio::test]
    async fn test_older_update_conflicts() {
        let remote = MemoryRemote::new();
        let t0 = clock::now();
        let id = remote.create_remote(&work(), t0).await.unwrap();

        let older = t0 - ChronoDuration::seconds(1);
        assert_eq!(
            remote.update_remote(&id, &work(), older).await.unwrap(),
            UpdateOutcome::Conflict
        );
        // Same revision again is an idempotent retry.
        assert_eq!(
            remote.update_remote(&id, &work(), t0).await.unwrap(),
            UpdateOutcome::Applied
        );

        remote.force_conflict(&id).await;
        assert_eq!(
            remote.update_remote(&id, &work(), t0).await.unwrap(),
            UpdateOutcome::Conflict
        );
        assert_eq!(
            remote.update_remote(&id, &work(), t0).await.unwrap(),
            UpdateOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_bumps_revision() {
        let remote = MemoryRemote::new();
        let t0 = clock::now();
        let id = remote.create_remote(&work(), t0).await.unwrap();

        remote.delete_remote(EntityKind::Calendar, &id).await.unwrap();
        remote.delete_remote(EntityKind::Calendar, &id).await.unwrap();
        remote.delete_remote(EntityKind::Calendar, "unknown").await.unwrap();

        let doc = remote.get(&id).await.unwrap().unwrap();
        assert!(doc.deleted);
        assert!(doc.updated_at > t0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new();
        remote.set_offline(true).await;
        let err = remote.fetch_changes_since(None).await.unwrap_err();
        assert!(err.is_retryable());

        remote.set_offline(false).await;
        let id = remote.create_remote(&work(), clock::now()).await.unwrap();
        remote.fail_sync_id(&id).await;
        assert!(remote.delete_remote(EntityKind::Calendar, &id).await.is_err());
        remote.heal_sync_id(&id).await;
        assert!(remote.delete_remote(EntityKind::Calendar, &id).await.is_ok());

        let err = remote.fetch_changes_since(Some("abc")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCursor(_)));

        let calls = remote.calls().await;
        assert_eq!(calls.fetch, 2);
        assert_eq!(calls.delete, 2);
        assert_eq!(calls.total(), 5);
    }
}
