//! # Sync State Machine
//!
//! Per-record lifecycle. Storage keeps three independent columns
//! (`sync_id`, `is_synced`, `is_deleted`); this module gives them a name and
//! a legal-transition table.
//!
//! ## Lifecycle
//! ```text
//!                  PushStarted                PushAcknowledged
//!   LOCAL_NEW ─────────────────► PENDING_PUSH ─────────────────► SYNCED
//!       │                          ▲      │ PushFailed (stays)     │
//!       │                          │      └──────────┘             │ UserEdit
//!       │                          │ PushStarted                   ▼
//!       │                          └────────────────────── LOCALLY_MODIFIED
//!       │                                                         │
//!       │ UserDelete (from any live state)                        │
//!       ▼                                                         ▼
//!   PENDING_DELETE ◄───────────────────────────────────────────────┘
//!       │
//!       │ PushAcknowledged (remote deleted it) / PullDeleted
//!       ▼
//!   DELETED_SYNCED ──── Purged (retention sweep) ────► PURGED (terminal)
//! ```
//!
//! `PENDING_DELETE` with no `sync_id` is purged directly: it never left the
//! device, so there is no remote deletion to wait for. `PullApplied` moves
//! any existing row to `SYNCED`.
//!
//! Only push acknowledgements and pull application lead into a synced
//! state. User events never move a record into one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::SyncMeta;

/// Lifecycle state of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Created locally, never pushed.
    LocalNew,
    /// A push request for the record's current content is in flight.
    PendingPush,
    /// Local content matches the remote.
    Synced,
    /// Was synced; the user changed it since.
    LocallyModified,
    /// Tombstone the remote has not confirmed yet.
    PendingDelete,
    /// Tombstone the remote has confirmed; waiting for the retention sweep.
    DeletedSynced,
    /// Row removed. Terminal.
    Purged,
}

/// Things that move a record between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    UserEdit,
    UserDelete,
    PushStarted,
    PushAcknowledged,
    PushFailed,
    PullApplied,
    PullDeleted,
    Purged,
}

impl SyncState {
    /// Derives the state of a stored row from its flags.
    ///
    /// `PendingPush` and `Purged` are never derived: the first only exists
    /// while the engine holds a request open, the second has no row.
    pub fn of(meta: &SyncMeta) -> Self {
        match (meta.is_deleted, meta.is_synced, meta.sync_id.is_some()) {
            (true, true, _) => SyncState::DeletedSynced,
            (true, false, _) => SyncState::PendingDelete,
            (false, true, _) => SyncState::Synced,
            (false, false, false) => SyncState::LocalNew,
            (false, false, true) => SyncState::LocallyModified,
        }
    }

    /// Applies `event`, returning the next state.
    ///
    /// ## Errors
    /// [`CoreError::InvalidTransition`] when the event is not legal here.
    pub fn apply(self, event: SyncEvent) -> CoreResult<SyncState> {
        use SyncEvent as E;
        use SyncState as S;

        let next = match (self, event) {
            (S::Purged, _) => None,

            // User mutations
            (S::LocalNew, E::UserEdit) => Some(S::LocalNew),
            (S::PendingPush, E::UserEdit) => Some(S::PendingPush),
            (S::Synced | S::LocallyModified, E::UserEdit) => Some(S::LocallyModified),
            (S::PendingDelete | S::DeletedSynced, E::UserEdit) => None,
            (S::DeletedSynced, E::UserDelete) => Some(S::DeletedSynced),
            (_, E::UserDelete) => Some(S::PendingDelete),

            // Push
            (S::LocalNew | S::LocallyModified, E::PushStarted) => Some(S::PendingPush),
            (S::PendingDelete, E::PushStarted) => Some(S::PendingDelete),
            (S::PendingPush, E::PushAcknowledged) => Some(S::Synced),
            (S::PendingDelete, E::PushAcknowledged) => Some(S::DeletedSynced),
            (S::PendingPush, E::PushFailed) => Some(S::PendingPush),
            (S::PendingDelete, E::PushFailed) => Some(S::PendingDelete),
            (_, E::PushStarted | E::PushAcknowledged | E::PushFailed) => None,

            // Pull
            (S::LocalNew, E::PullApplied | E::PullDeleted) => None,
            (_, E::PullApplied) => Some(S::Synced),
            (_, E::PullDeleted) => Some(S::DeletedSynced),

            // Retention sweep
            (S::DeletedSynced | S::PendingDelete, E::Purged) => Some(S::Purged),
            (_, E::Purged) => None,
        };

        next.ok_or_else(|| CoreError::InvalidTransition {
            from: self.to_string(),
            event: event.to_string(),
        })
    }

    /// True if the record has local changes the remote has not seen.
    pub fn needs_push(self) -> bool {
        matches!(
            self,
            SyncState::LocalNew
                | SyncState::PendingPush
                | SyncState::LocallyModified
                | SyncState::PendingDelete
        )
    }

    /// True if the state is a tombstone of either kind.
    pub fn is_tombstone(self) -> bool {
        matches!(self, SyncState::PendingDelete | SyncState::DeletedSynced)
    }
}

/// True if the retention sweep may remove this row.
///
/// Either the remote confirmed the deletion, or the record never had a
/// `sync_id` and so never reached the remote.
pub fn is_purge_eligible(meta: &SyncMeta) -> bool {
    meta.is_deleted && (meta.is_synced || meta.sync_id.is_none())
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::LocalNew => "LOCAL_NEW",
            SyncState::PendingPush => "PENDING_PUSH",
            SyncState::Synced => "SYNCED",
            SyncState::LocallyModified => "LOCALLY_MODIFIED",
            SyncState::PendingDelete => "PENDING_DELETE",
            SyncState::DeletedSynced => "DELETED_SYNCED",
            SyncState::Purged => "PURGED",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncEvent::UserEdit => "user_edit",
            SyncEvent::UserDelete => "user_delete",
            SyncEvent::PushStarted => "push_started",
            SyncEvent::PushAcknowledged => "push_acknowledged",
            SyncEvent::PushFailed => "push_failed",
            SyncEvent::PullApplied => "pull_applied",
            SyncEvent::PullDeleted => "pull_deleted",
            SyncEvent::Purged => "purged",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(sync_id: Option<&str>, is_synced: bool, is_deleted: bool) -> SyncMeta {
        let mut meta = SyncMeta::new_local();
        meta.sync_id = sync_id.map(str::to_string);
        meta.is_synced = is_synced;
        meta.is_deleted = is_deleted;
        meta
    }

    #[test]
    fn test_state_derivation() {
        assert_eq!(SyncState::of(&meta(None, false, false)), SyncState::LocalNew);
        assert_eq!(SyncState::of(&meta(Some("r"), true, false)), SyncState::Synced);
        assert_eq!(
            SyncState::of(&meta(Some("r"), false, false)),
            SyncState::LocallyModified
        );
        assert_eq!(SyncState::of(&meta(None, false, true)), SyncState::PendingDelete);
        assert_eq!(
            SyncState::of(&meta(Some("r"), false, true)),
            SyncState::PendingDelete
        );
        assert_eq!(
            SyncState::of(&meta(Some("r"), true, true)),
            SyncState::DeletedSynced
        );
    }

    #[test]
    fn test_happy_path() {
        let state = SyncState::LocalNew
            .apply(SyncEvent::PushStarted)
            .and_then(|s| s.apply(SyncEvent::PushAcknowledged))
            .and_then(|s| s.apply(SyncEvent::UserEdit))
            .and_then(|s| s.apply(SyncEvent::PushStarted))
            .and_then(|s| s.apply(SyncEvent::PushAcknowledged))
            .and_then(|s| s.apply(SyncEvent::UserDelete))
            .and_then(|s| s.apply(SyncEvent::PushStarted))
            .and_then(|s| s.apply(SyncEvent::PushAcknowledged))
            .and_then(|s| s.apply(SyncEvent::Purged))
            .unwrap();

        assert_eq!(state, SyncState::Purged);
    }

    #[test]
    fn test_user_events_leave_work_pending() {
        let all = [
            SyncState::LocalNew,
            SyncState::PendingPush,
            SyncState::Synced,
            SyncState::LocallyModified,
            SyncState::PendingDelete,
            SyncState::DeletedSynced,
        ];
        for state in all {
            if let Ok(next) = state.apply(SyncEvent::UserEdit) {
                assert!(next.needs_push(), "{state} + user_edit -> {next}");
            }
            let next = state.apply(SyncEvent::UserDelete).unwrap();
            assert!(next.is_tombstone());
        }
    }

    #[test]
    fn test_failed_push_stays_pending() {
        let in_flight = SyncState::LocallyModified
            .apply(SyncEvent::PushStarted)
            .unwrap();
        assert_eq!(in_flight, SyncState::PendingPush);
        assert_eq!(
            in_flight.apply(SyncEvent::PushFailed).unwrap(),
            SyncState::PendingPush
        );
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(SyncState::Synced.apply(SyncEvent::PushAcknowledged).is_err());
        assert!(SyncState::LocalNew.apply(SyncEvent::PullApplied).is_err());
        assert!(SyncState::Synced.apply(SyncEvent::Purged).is_err());
        assert!(SyncState::PendingDelete.apply(SyncEvent::UserEdit).is_err());
        assert!(SyncState::Purged.apply(SyncEvent::UserDelete).is_err());
    }

    #[test]
    fn test_remote_newer_pull_resurrects_tombstone() {
        assert_eq!(
            SyncState::DeletedSynced.apply(SyncEvent::PullApplied).unwrap(),
            SyncState::Synced
        );
    }

    #[test]
    fn test_purge_eligibility() {
        assert!(is_purge_eligible(&meta(None, false, true)));
        assert!(is_purge_eligible(&meta(Some("r"), true, true)));
        assert!(!is_purge_eligible(&meta(Some("r"), false, true)));
        assert!(!is_purge_eligible(&meta(Some("r"), true, false)));
    }
}
