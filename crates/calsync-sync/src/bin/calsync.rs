//! # Sync Walkthrough
//!
//! Runs a few reconciliation cycles against an in-process remote and prints
//! each report.
//!
//! ## Usage
//! ```bash
//! # In-memory store
//! cargo run -p calsync-sync --bin calsync
//!
//! # File-backed store, custom config, verbose engine logs
//! RUST_LOG=calsync=debug cargo run -p calsync-sync --bin calsync -- \
//!     --db ./calsync_dev.db --config ./sync.toml
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use calsync_core::{clock, Calendar, CalendarType, Event, SyncEntity};
use calsync_db::{Database, DbConfig};
use calsync_sync::{EventPayload, MemoryRemote, Reconciler, RemoteEntity, SyncConfig};
use chrono::Duration;
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,calsync=info,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("calsync sync walkthrough");
                println!();
                println!("Usage: calsync [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>       SQLite file (default: in-memory)");
                println!("  -c, --config <PATH>   sync.toml to load");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let config = SyncConfig::load_or_default(config_path);
    let db_config = match db_path.or_else(|| config.database_path()) {
        Some(path) => DbConfig::new(path),
        None => DbConfig::in_memory(),
    };
    let db = Arc::new(Database::new(db_config).await?);
    let remote = Arc::new(MemoryRemote::new());
    let reconciler = Reconciler::new(db.clone(), remote.clone(), Arc::new(config));

    // 1. Local creation
    let work = Calendar::new("Work", "#1E88E5", CalendarType::Local)?.primary(true);
    db.calendars().insert(&work).await?;

    let mut view = db.events().watch_calendar(work.id());
    let watcher = tokio::spawn(async move {
        while let Some(Ok(events)) = view.next().await {
            info!(count = events.len(), "Work calendar view refreshed");
        }
    });

    let start = clock::now() + Duration::hours(1);
    let standup = Event::new("Standup", start, start + Duration::minutes(15), work.id())?
        .location("Room 4")
        .reminder(10);
    db.events().insert(&standup).await?;

    let report = reconciler.run_cycle().await?;
    println!("[create]  {}", report);

    // 2. Another device edits the event with a newer revision
    let pushed = db
        .events()
        .get_by_id(standup.id())
        .await?
        .ok_or("standup missing after push")?;
    let calendar_ref = db
        .calendars()
        .get_by_id(work.id())
        .await?
        .and_then(|c| c.meta.sync_id)
        .ok_or("calendar has no sync id")?;
    let sync_id = pushed.sync_id().ok_or("standup has no sync id")?.to_string();

    let mut moved = pushed.clone();
    moved.title = "Standup (moved)".into();
    moved.start = pushed.start + Duration::minutes(30);
    moved.end = pushed.end + Duration::minutes(30);
    remote
        .put(
            Some(&sync_id),
            &RemoteEntity::Event(EventPayload::from_event(&moved, calendar_ref)),
            pushed.updated_at() + Duration::seconds(5),
            false,
        )
        .await?;

    let report = reconciler.run_cycle().await?;
    println!("[pull]    {}", report);
    if let Some(event) = db.events().get_by_id(standup.id()).await? {
        println!("          local title is now {:?}", event.title);
    }

    // 3. Local deletion
    db.events().soft_delete(standup.id()).await?;
    let report = reconciler.run_cycle().await?;
    println!("[delete]  {}", report);

    let pending = reconciler.pending_count().await?;
    let tombstones = db.events().count_tombstones().await?;
    info!(pending, tombstones, remote_docs = remote.len().await, "Walkthrough finished");

    watcher.abort();
    db.close().await;
    Ok(())
}
