//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each subcommand
//! builds its own Tokio runtime and connects to storage on demand.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use utsav::db::Database;
use utsav::leaderboard::{Leaderboard, LeaderboardFilter};
use utsav::memory::MemoryStore;
use utsav::server::{self, AppState};
use utsav::store::ProgressStore;

use super::Cli;

/// OTP challenges are kept this long past expiry before `sweep` deletes them.
const OTP_RETENTION_HOURS: i64 = 24;

fn require_database_url(cli: &Cli) -> Result<&str> {
    cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })
}

pub fn run_serve(cli: &Cli, port: u16, memory: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(cli, port, memory))
}

async fn serve(cli: &Cli, port: u16, memory: bool) -> Result<()> {
    let store: Arc<dyn ProgressStore> = if memory {
        info!("using in-memory store with demo event (QR token DEMO)");
        Arc::new(MemoryStore::with_demo_event())
    } else {
        let database = Database::connect(require_database_url(cli)?).await?;
        database.migrate().await?;
        Arc::new(database)
    };
    server::run(port, store, cli.engine.clone()).await
}

pub fn run_migrate(cli: &Cli) -> Result<()> {
    let database_url = require_database_url(cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(migrate(database_url))
}

async fn migrate(database_url: &str) -> Result<()> {
    let database = Database::connect(database_url).await?;
    database.migrate().await?;
    println!("Schema is up to date");
    Ok(())
}

pub fn run_sweep(cli: &Cli, older_than_minutes: Option<i64>) -> Result<()> {
    let max_age = older_than_minutes
        .filter(|m| *m > 0)
        .map(chrono::Duration::minutes)
        .or_else(|| cli.engine.stale_after())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no stale age given (use --older-than-minutes or UTSAV_STALE_AFTER_MINUTES)"
            )
        })?;
    let database_url = require_database_url(cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(sweep(cli, database_url, max_age))
}

async fn sweep(cli: &Cli, database_url: &str, max_age: chrono::Duration) -> Result<()> {
    let database = Database::connect(database_url).await?;
    let purged = database
        .purge_expired_otps(chrono::Utc::now() - chrono::Duration::hours(OTP_RETENTION_HOURS))
        .await?;
    let state = AppState::build(Arc::new(database), cli.engine.clone());
    let expired = state.tracker.expire_stale_attempts(max_age).await?;
    println!(
        "Expired {} stale attempt(s), purged {} OTP challenge(s)",
        expired.len(),
        purged
    );
    Ok(())
}

pub fn run_leaderboard(
    cli: &Cli,
    event_id: i64,
    filter: &str,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter: LeaderboardFilter = filter.parse()?;
    let database_url = require_database_url(cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    let board = rt.block_on(fetch_leaderboard(cli, database_url, event_id, &filter, limit))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&board)?);
    } else {
        print!("{}", render_table(&board));
    }
    Ok(())
}

async fn fetch_leaderboard(
    cli: &Cli,
    database_url: &str,
    event_id: i64,
    filter: &LeaderboardFilter,
    limit: u32,
) -> Result<Leaderboard> {
    let database = Database::connect(database_url).await?;
    let state = AppState::build(Arc::new(database), cli.engine.clone());
    let board = state
        .leaderboard
        .get_leaderboard(event_id, filter, Some(limit), None, None)
        .await?;
    Ok(board)
}

fn render_table(board: &Leaderboard) -> String {
    let mut out = format!(
        "Event {} ({}), {} ranked of {} participants\n",
        board.event_id, board.filter, board.total, board.total_participants
    );
    out.push_str(&format!(
        "{:>4}  {:<24} {:>6} {:>10} {:>8}\n",
        "RANK", "NAME", "LEVELS", "SCORE", "TIME(s)"
    ));
    for entry in &board.entries {
        out.push_str(&format!(
            "{:>4}  {:<24} {:>6} {:>10.1} {:>8}\n",
            entry.rank,
            entry.display_name,
            entry.levels_completed,
            entry.total_score,
            entry.total_time_seconds
        ));
    }
    out
}
