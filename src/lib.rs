pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod leaderboard;
pub mod memory;
pub mod model;
pub mod prom_metrics;
pub mod retry;
pub mod server;
pub mod store;
pub mod tracker;
