//! # Sync Agent
//!
//! Background driver around the [`Reconciler`]: runs cycles on a timer
//! (`auto`), on request (`sync_now`), and backs off while the remote fails.
//!
//! ## Agent Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncAgent Loop                                │
//! │                                                                         │
//! │  SyncAgentHandle                     background task                   │
//! │  ┌──────────────┐   trigger (mpsc)   ┌───────────────────────────────┐ │
//! │  │ sync_now()   │ ─────────────────► │ tokio::select!                │ │
//! │  │              │ ◄── oneshot reply  │   ├─ timer (auto mode only)   │ │
//! │  │ status()     │                    │   ├─ trigger                  │ │
//! │  │ shutdown()   │ ─── shutdown ────► │   └─ shutdown                 │ │
//! │  └──────────────┘                    │           │                   │ │
//! │                                      │           ▼                   │ │
//! │                                      │   Reconciler::run_cycle()     │ │
//! │                                      │           │                   │ │
//! │                                      │   clean ──► poll interval     │ │
//! │                                      │   failed ─► exponential       │ │
//! │                                      │             backoff           │ │
//! │                                      └───────────────────────────────┘ │
//! │                                                                         │
//! │  STATUS EVENTS (SyncEventEmitter):                                     │
//! │  emit_status  - state, pending count, last error                       │
//! │  emit_report  - CycleReport after every finished cycle                 │
//! │  emit_error   - message + retryable for failed cycles                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! In `offline` mode no task is spawned and `sync_now` returns
//! [`SyncError::Disabled`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use calsync_db::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SyncConfig, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::reconciler::{CycleReport, Reconciler};
use crate::remote::RemoteStore;

type Reply = oneshot::Sender<SyncResult<CycleReport>>;

// =============================================================================
// Sync Status
// =============================================================================

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Syncing,
    /// The last cycle failed; the next timed cycle is delayed.
    Backoff,
    /// Sync mode is `offline`.
    Offline,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Syncing => "syncing",
            AgentState::Backoff => "backoff",
            AgentState::Offline => "offline",
            AgentState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Current sync status for external queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub state: AgentState,

    pub mode: SyncMode,

    /// Start of the last cycle that finished.
    pub last_sync: Option<DateTime<Utc>>,

    pub last_report: Option<CycleReport>,

    /// Rows waiting to be pushed, as of the last cycle.
    pub pending_count: i64,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// Cycles in a row that failed or left retryable record failures.
    pub consecutive_failures: u32,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives agent notifications (UI bridge, logs, tests).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_report(&self, report: &CycleReport);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_report(&self, _report: &CycleReport) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Owns a [`Reconciler`] and schedules its cycles.
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    reconciler: Arc<Reconciler>,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl SyncAgent {
    pub fn new(config: SyncConfig, db: Arc<Database>, remote: Arc<dyn RemoteStore>) -> Self {
        Self::with_emitter(config, db, remote, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        config: SyncConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let config = Arc::new(config);
        let status = SyncStatus {
            mode: config.mode(),
            ..Default::default()
        };

        SyncAgent {
            reconciler: Arc::new(Reconciler::new(db, remote, config.clone())),
            config,
            status: Arc::new(RwLock::new(status)),
            emitter,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Validates the config and spawns the background loop.
    ///
    /// In `offline` mode nothing is spawned; the returned handle reports
    /// [`AgentState::Offline`].
    pub async fn start(self) -> SyncResult<SyncAgentHandle> {
        self.config.validate()?;

        if !self.config.is_sync_enabled() {
            info!("Sync is disabled (mode: offline)");
            let status = {
                let mut s = self.status.write().await;
                s.state = AgentState::Offline;
                s.clone()
            };
            self.emitter.emit_status(&status);
            return Ok(SyncAgentHandle {
                trigger_tx: None,
                shutdown_tx: None,
                status: self.status,
                task: None,
            });
        }

        info!(
            device_id = %self.config.device_id(),
            mode = %self.config.mode(),
            poll_interval_secs = self.config.sync.poll_interval_secs,
            "Starting sync agent"
        );

        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let status = self.status.clone();
        let task = tokio::spawn(self.run(trigger_rx, shutdown_rx));

        Ok(SyncAgentHandle {
            trigger_tx: Some(trigger_tx),
            shutdown_tx: Some(shutdown_tx),
            status,
            task: Some(task),
        })
    }

    /// Main loop. Ends on shutdown or when the handle is dropped.
    async fn run(self, mut trigger_rx: mpsc::Receiver<Reply>, mut shutdown_rx: mpsc::Receiver<()>) {
        let periodic = self.config.mode().is_periodic();
        let mut backoff = self.create_backoff();
        // Auto mode syncs right away on start.
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay), if periodic => {
                    delay = self.cycle(&mut backoff, None).await;
                }

                Some(reply) = trigger_rx.recv() => {
                    delay = self.cycle(&mut backoff, Some(reply)).await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync agent received shutdown");
                    break;
                }
            }
        }

        let status = {
            let mut s = self.status.write().await;
            s.state = AgentState::Stopped;
            s.clone()
        };
        self.emitter.emit_status(&status);
        info!("Sync agent stopped");
    }

    /// Runs one cycle, updates the status and returns the delay until the
    /// next timed cycle.
    async fn cycle(&self, backoff: &mut ExponentialBackoff, reply: Option<Reply>) -> Duration {
        self.status.write().await.state = AgentState::Syncing;

        let result = self.reconciler.run_cycle().await;
        let pending = self.reconciler.pending_count().await;

        let (delay, status) = {
            let mut s = self.status.write().await;
            match pending {
                Ok(count) => s.pending_count = count,
                Err(e) => warn!(error = %e, "Could not count pending rows"),
            }

            let failed = match &result {
                Ok(report) => {
                    s.last_sync = Some(report.started_at);
                    s.last_report = Some(report.clone());
                    s.last_error = report
                        .pull
                        .fetch_error
                        .as_ref()
                        .map(|f| f.error.clone())
                        .or_else(|| report.failures.first().map(|f| f.error.clone()));
                    report.has_transient_failures()
                }
                Err(e) => {
                    s.last_error = Some(e.to_string());
                    true
                }
            };

            let delay = if failed {
                s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                s.state = AgentState::Backoff;
                backoff.next_backoff().unwrap_or(backoff.max_interval)
            } else {
                s.consecutive_failures = 0;
                s.state = AgentState::Idle;
                backoff.reset();
                self.config.poll_interval()
            };
            (delay, s.clone())
        };

        match &result {
            Ok(report) => {
                if let Some(fetch) = &report.pull.fetch_error {
                    self.emitter.emit_error(&fetch.error, fetch.retryable);
                }
                self.emitter.emit_report(report);
            }
            Err(e) => {
                error!(error = %e, failures = status.consecutive_failures, "Sync cycle failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
            }
        }
        self.emitter.emit_status(&status);
        if status.state == AgentState::Backoff {
            debug!(delay = ?delay, "Backing off");
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        delay
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.sync.initial_backoff_ms),
            max_interval: Duration::from_secs(self.config.sync.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Controls a started [`SyncAgent`].
///
/// Dropping the handle stops the background loop after the current cycle.
pub struct SyncAgentHandle {
    trigger_tx: Option<mpsc::Sender<Reply>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    status: Arc<RwLock<SyncStatus>>,
    task: Option<JoinHandle<()>>,
}

impl SyncAgentHandle {
    /// Runs a cycle now and waits for its report.
    ///
    /// ## Errors
    /// - [`SyncError::Disabled`] in offline mode
    /// - [`SyncError::ShuttingDown`] if the agent has stopped
    /// - whatever [`Reconciler::run_cycle`] returned
    pub async fn sync_now(&self) -> SyncResult<CycleReport> {
        let trigger = self.trigger_tx.as_ref().ok_or(SyncError::Disabled)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        trigger
            .send(reply_tx)
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Gets the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Stops the agent and waits for the loop to finish.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SyncError::Internal(format!("sync task failed: {}", e)))?;
        }
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    db: Option<Arc<Database>>,
    remote: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            remote: None,
            emitter: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<SyncAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncAgent::with_emitter(self.config, db, remote, emitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use calsync_core::{Calendar, CalendarType};
    use calsync_db::DbConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<usize>,
        errors: Mutex<Vec<String>>,
    }

    impl SyncEventEmitter for Recorder {
        fn emit_status(&self, _status: &SyncStatus) {}

        fn emit_report(&self, _report: &CycleReport) {
            *self.reports.lock().unwrap() += 1;
        }

        fn emit_error(&self, message: &str, _retryable: bool) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn config(mode: SyncMode) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.mode = mode;
        config
    }

    async fn setup() -> (Arc<Database>, Arc<MemoryRemote>) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        (db, Arc::new(MemoryRemote::new()))
    }

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync.is_none());
        assert_eq!(AgentState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_builder_requires_remote() {
        let (db, _) = setup().await;
        let result = SyncAgentBuilder::new(config(SyncMode::Manual))
            .with_database(db)
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_manual_sync_now() {
        let (db, remote) = setup().await;
        let cal = Calendar::with_default_color("Work", CalendarType::Local).unwrap();
        db.calendars().insert(&cal).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let handle = SyncAgentBuilder::new(config(SyncMode::Manual))
            .with_database(db.clone())
            .with_remote(remote.clone())
            .with_emitter(recorder.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        // Manual mode never syncs on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.calls().await.total(), 0);

        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.push.created, 1);

        let status = handle.status().await;
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.mode, SyncMode::Manual);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.last_sync, Some(report.started_at));
        assert_eq!(*recorder.reports.lock().unwrap(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_mode_is_inert() {
        let (db, remote) = setup().await;
        let handle = SyncAgent::new(config(SyncMode::Offline), db, remote.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(handle.status().await.state, AgentState::Offline);
        assert!(matches!(handle.sync_now().await, Err(SyncError::Disabled)));
        assert_eq!(remote.calls().await.total(), 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_mode_syncs_on_start() {
        let (db, remote) = setup().await;
        let handle = SyncAgent::new(config(SyncMode::Auto), db, remote.clone())
            .start()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.calls().await.fetch, 1);
        assert!(handle.status().await.last_sync.is_some());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_cycle_enters_backoff() {
        let (db, remote) = setup().await;
        let recorder = Arc::new(Recorder::default());
        let handle = SyncAgent::with_emitter(config(SyncMode::Manual), db, remote.clone(), recorder.clone())
            .start()
            .await
            .unwrap();

        remote.set_offline(true).await;
        let report = handle.sync_now().await.unwrap();
        assert!(report.pull.fetch_error.is_some());
        assert!(report.has_transient_failures());

        let status = handle.status().await;
        assert_eq!(status.state, AgentState::Backoff);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);

        remote.set_offline(false).await;
        handle.sync_now().await.unwrap();
        let status = handle.status().await;
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (db, remote) = setup().await;
        let agent = SyncAgent::new(config(SyncMode::Manual), db, remote);
        let status = agent.status.clone();
        let handle = agent.start().await.unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(status.read().await.state, AgentState::Stopped);
    }
}
