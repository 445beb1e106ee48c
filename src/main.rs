//! # Main — CLI Entry Point
//!
//! Routes subcommands to the server and to one-shot maintenance tasks.
//!
//! ## Subcommands
//!
//! - `serve`: HTTP API (PostgreSQL, or `--memory` for an in-process demo store)
//! - `migrate`: apply the bundled SQL schema
//! - `sweep`: fail stale in-progress attempts and purge expired OTPs once
//! - `leaderboard`: print an event's standings
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection.
//! - Engine knobs (`UTSAV_*`), see [`utsav::config::EngineConfig`].

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use utsav::config::EngineConfig;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "utsav", about = "Level progress and leaderboard engine for event games")]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(flatten)]
    engine: EngineConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Use an in-process store seeded with a demo event (QR token DEMO)
        #[arg(long)]
        memory: bool,
    },
    /// Apply the database schema
    Migrate,
    /// Fail stale in-progress attempts and purge expired OTP challenges
    Sweep {
        /// Age in minutes after which an attempt is stale (defaults to UTSAV_STALE_AFTER_MINUTES)
        #[arg(long)]
        older_than_minutes: Option<i64>,
    },
    /// Print an event's leaderboard
    Leaderboard {
        /// Event ID
        #[arg(long)]
        event_id: i64,
        /// Filter: all, completed, or group:<name>
        #[arg(long, default_value = "all")]
        filter: String,
        /// Number of entries to print
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for container log shipping, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { port, memory } => cli::run_serve(&cli, *port, *memory),
        Commands::Migrate => cli::run_migrate(&cli),
        Commands::Sweep { older_than_minutes } => cli::run_sweep(&cli, *older_than_minutes),
        Commands::Leaderboard {
            event_id,
            filter,
            limit,
            json,
        } => cli::run_leaderboard(&cli, *event_id, filter, *limit, *json),
    }
}
