//! # Change Notifications
//!
//! Every committed mutation publishes a [`TableChange`]. Reactive views are
//! built on top: a view runs its query once, then again after each change to
//! its table, and yields only results that differ from the previous one.
//!
//! ```text
//! repository write ──► COMMIT ──► ChangeFeed::publish(TableChange)
//!                                          │
//!                    ┌─────────────────────┼─────────────────────┐
//!                    ▼                     ▼                     ▼
//!              watch_visible()       watch_range(..)      raw subscriber
//!              re-query, dedupe      re-query, dedupe
//! ```
//!
//! Notifications are sent after the transaction commits, so a view never
//! observes a half-applied write. A subscriber that falls behind the buffer
//! gets one re-query instead of the missed notifications.

use std::future::{self, Future};

use calsync_core::EntityKind;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::error::DbResult;

/// Table a change happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Events,
    Calendars,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Events => "events",
            Table::Calendars => "calendars",
        }
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Event => Table::Events,
            EntityKind::Calendar => Table::Calendars,
        }
    }
}

/// What kind of mutation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Only sync metadata changed (`is_synced`, `sync_id`).
    SyncFlag,
    Purge,
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: Table,
    pub kind: ChangeKind,
    /// Rows touched.
    pub rows: u64,
}

/// Broadcast channel of committed changes.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<TableChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeFeed { tx }
    }

    /// Publishes a change. Having no subscribers is not an error.
    pub fn publish(&self, table: Table, kind: ChangeKind, rows: u64) {
        if rows == 0 {
            return;
        }
        trace!(table = table.name(), ?kind, rows, "Change committed");
        let _ = self.tx.send(TableChange { table, kind, rows });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.tx.subscribe()
    }

    /// Builds a reactive view over `tables`.
    ///
    /// The returned stream yields the current result of `query` first, then a
    /// fresh result after every change to one of `tables`, skipping results
    /// equal to the last one yielded. Query errors are passed through.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let repo = db.calendars();
    /// let mut visible = db.changes().watch(&[Table::Calendars], move || {
    ///     let repo = repo.clone();
    ///     async move { repo.query_visible().await }
    /// });
    /// while let Some(calendars) = visible.next().await { /* render */ }
    /// ```
    pub fn watch<T, F, Fut>(&self, tables: &[Table], query: F) -> BoxStream<'static, DbResult<T>>
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = DbResult<T>> + Send + 'static,
    {
        // Subscribe before the first query so no commit slips in between.
        let rx = self.tx.subscribe();
        let tables = tables.to_vec();

        let triggers = BroadcastStream::new(rx).filter_map(move |msg| {
            let relevant = match msg {
                Ok(change) => tables.contains(&change.table),
                // Lagged: we missed something, re-query to be safe
                Err(_) => true,
            };
            future::ready(relevant.then_some(()))
        });

        stream::once(future::ready(()))
            .chain(triggers)
            .then(move |_| query())
            .scan(None::<T>, |last, result| {
                let out = match result {
                    Ok(snapshot) if last.as_ref() == Some(&snapshot) => None,
                    Ok(snapshot) => {
                        *last = Some(snapshot.clone());
                        Some(Ok(snapshot))
                    }
                    Err(e) => Some(Err(e)),
                };
                future::ready(Some(out))
            })
            .filter_map(future::ready)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let feed = ChangeFeed::new(4);
        feed.publish(Table::Events, ChangeKind::Insert, 1);

        let mut rx = feed.subscribe();
        feed.publish(Table::Events, ChangeKind::Insert, 0);
        feed.publish(Table::Calendars, ChangeKind::Update, 2);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.table, Table::Calendars);
        assert_eq!(change.rows, 2);
    }

    #[tokio::test]
    async fn test_watch_dedupes_and_filters_tables() {
        let feed = ChangeFeed::new(16);
        let counter = Arc::new(AtomicU32::new(0));

        // Result only changes every second query
        let c = counter.clone();
        let mut view = feed.watch(&[Table::Events], move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n / 2) }
        });

        assert_eq!(view.next().await.unwrap().unwrap(), 0);

        // Unrelated table: no re-query
        feed.publish(Table::Calendars, ChangeKind::Insert, 1);
        // First event change: query returns 0 again (deduped), second returns 1
        feed.publish(Table::Events, ChangeKind::Insert, 1);
        feed.publish(Table::Events, ChangeKind::Update, 1);

        let next = tokio::time::timeout(Duration::from_secs(1), view.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
