//! # Seed Data Generator
//!
//! Populates a local store with calendars and events for development.
//!
//! ## Usage
//! ```bash
//! # Generate 500 events (default) spread over the next 60 days
//! cargo run -p calsync-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p calsync-db --bin seed -- --count 5000
//!
//! # Specify database path
//! cargo run -p calsync-db --bin seed -- --db ./data/calsync.db
//! ```
//!
//! ## Generated Data
//! - Four calendars (Personal is primary, Holidays is hidden)
//! - Events cycling through a fixed set of titles, one to three per day,
//!   some all-day, some with reminders and weekly recurrence
//!
//! Everything is created as local, never-synced data.

use std::env;

use calsync_core::{clock, Calendar, CalendarType, Event, SyncEntity};
use calsync_db::{Database, DbConfig};
use chrono::{Duration, DurationRound};

/// (name, color, type, visible, primary)
const CALENDARS: &[(&str, &str, CalendarType, bool, bool)] = &[
    ("Personal", "#6750A4", CalendarType::Local, true, true),
    ("Work", "#1E88E5", CalendarType::ProviderA, true, false),
    ("Family", "#43A047", CalendarType::ProviderB, true, false),
    ("Holidays", "#E53935", CalendarType::ProviderC, false, false),
];

/// (title, location, duration minutes)
const TEMPLATES: &[(&str, Option<&str>, i64)] = &[
    ("Standup", Some("Room 4"), 15),
    ("1:1", None, 30),
    ("Lunch", Some("Cafe"), 60),
    ("Planning", Some("Room 1"), 90),
    ("Gym", Some("Downtown"), 60),
    ("Dentist", Some("Main St"), 45),
    ("Code review", None, 30),
    ("Dinner", Some("Home"), 120),
    ("Call with parents", None, 30),
    ("Book club", Some("Library"), 90),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 500;
    let mut db_path = String::from("./calsync_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("calsync Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of events to generate (default: 500)");
                println!("  -d, --db <PATH>    Database file path (default: ./calsync_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("calsync Seed Data Generator");
    println!("===========================");
    println!("Database: {}", db_path);
    println!("Events:   {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.calendars().list_all().await?;
    if !existing.is_empty() {
        println!("⚠ Database already has {} calendars", existing.len());
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let calendars = CALENDARS
        .iter()
        .map(|&(name, color, calendar_type, visible, primary)| {
            Calendar::new(name, color, calendar_type).map(|c| c.visible(visible).primary(primary))
        })
        .collect::<Result<Vec<_>, _>>()?;
    db.calendars().insert_batch(&calendars).await?;
    println!("✓ Created {} calendars", calendars.len());

    println!();
    println!("Generating events...");
    let started = std::time::Instant::now();

    let today = clock::now().duration_trunc(Duration::days(1))?;
    let mut batch = Vec::with_capacity(100);
    for n in 0..count {
        batch.push(generate_event(n, today, &calendars)?);
        if batch.len() == 100 {
            db.events().insert_batch(&batch).await?;
            batch.clear();
        }
        if (n + 1) % 500 == 0 {
            println!("  Generated {} events...", n + 1);
        }
    }
    db.events().insert_batch(&batch).await?;

    let elapsed = started.elapsed();
    println!();
    println!("✓ Generated {} events in {:?}", count, elapsed);
    println!(
        "  Rate: {:.0} events/second",
        count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    println!();
    println!("Verifying views...");
    let week = db
        .events()
        .query_visible_in_range(today, today + Duration::days(7))
        .await?;
    println!("  Visible this week: {}", week.len());
    let hits = db.events().search("standup").await?;
    println!("  Search 'standup': {} results", hits.len());
    println!("  Unsynced events: {}", db.events().count_unsynced().await?);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Builds the `n`th event: spread over 60 days from `day0`, up to three a day.
fn generate_event(
    n: usize,
    day0: chrono::DateTime<chrono::Utc>,
    calendars: &[Calendar],
) -> Result<Event, calsync_core::CoreError> {
    let (title, location, minutes) = TEMPLATES[n % TEMPLATES.len()];
    let calendar = &calendars[n % calendars.len()];

    let day = (n / 3) as i64 % 60;
    let hour = 8 + (n % 3) as i64 * 4;
    let start = day0 + Duration::days(day) + Duration::hours(hour);

    let mut event = Event::new(title, start, start + Duration::minutes(minutes), calendar.id())?
        .color(calendar.color.clone());
    if let Some(location) = location {
        event = event.location(location);
    }
    if n % 7 == 0 {
        event = event.reminder(10);
    }
    if n % 11 == 0 {
        event = event.recurrence("FREQ=WEEKLY");
    }
    if n % 13 == 0 {
        event = event.all_day(true);
    }
    Ok(event)
}
