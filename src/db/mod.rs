//! # Database — PostgreSQL Storage Layer
//!
//! Implements [`ProgressStore`] over a `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `users`: phone-verified participants
//! - `events`, `event_levels`: the catalog (read-only to the engine)
//! - `event_groups`, `event_group_members`: named cohorts for leaderboard filters
//! - `otp_challenges`: hashed login codes
//! - `level_progress`: one row per `(user_id, event_id, level_id)`, carrying
//!   the resumable `game_state` of an open attempt
//!
//! ## Module Structure
//!
//! - [`catalog`] — events, levels, groups
//! - [`users`] — user lookup and creation
//! - [`otp`] — OTP challenge issue and consume
//! - [`progress`] — progress create-or-fetch, conditional completion, scans
//!
//! ## Concurrency
//!
//! Start is `INSERT ... ON CONFLICT DO NOTHING` followed by a fetch on the
//! unique key, so concurrent starts converge on one row. Completion is a
//! single `UPDATE ... WHERE state = 'in_progress'`, so exactly one caller
//! sees the row come back. Neither takes locks beyond the touched row.

mod catalog;
mod otp;
mod progress;
mod users;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::model::{
    Completion, Event, EventId, Level, LevelId, NewProgress, ProgressId, ProgressRecord, User,
    UserId,
};
use crate::store::ProgressStore;

const MIGRATIONS: [(&str, &str); 4] = [
    ("001_catalog", include_str!("../../migrations/001_catalog.sql")),
    ("002_auth", include_str!("../../migrations/002_auth.sql")),
    ("003_progress", include_str!("../../migrations/003_progress.sql")),
    ("004_game_state", include_str!("../../migrations/004_game_state.sql")),
];

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed by hand so percent-encoded usernames (pooler-style
    /// `user.project`) survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, 10).await
    }

    pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            tracing::info!(migration = name, "migration applied");
        }
        Ok(())
    }

    /// Execute `SELECT 1`. Backs the `/readyz` check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for Database {
    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        self.event_by_id(event_id).await
    }

    async fn get_event_by_qr(&self, qr_token: &str) -> Result<Option<Event>> {
        self.event_by_qr(qr_token).await
    }

    async fn get_levels(&self, event_id: EventId) -> Result<Vec<Level>> {
        self.enabled_levels(event_id).await
    }

    async fn get_group_members(
        &self,
        event_id: EventId,
        group: &str,
    ) -> Result<Option<Vec<UserId>>> {
        self.group_members(event_id, group).await
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.user_by_id(user_id).await
    }

    async fn get_users(&self, user_ids: &[UserId]) -> Result<Vec<User>> {
        self.users_by_ids(user_ids).await
    }

    async fn get_user_by_phone(&self, phone_number: &str) -> Result<Option<User>> {
        self.user_by_phone(phone_number).await
    }

    async fn create_user(&self, phone_number: &str, display_name: &str) -> Result<User> {
        self.insert_user(phone_number, display_name).await
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<Option<User>> {
        self.set_display_name(user_id, display_name).await
    }

    async fn store_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.insert_otp(phone_number, code_hash, expires_at).await
    }

    async fn consume_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.claim_otp(phone_number, code_hash, now).await
    }

    async fn list_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Vec<ProgressRecord>> {
        self.progress_for_user(user_id, event_id).await
    }

    async fn get_progress(&self, progress_id: ProgressId) -> Result<Option<ProgressRecord>> {
        self.progress_by_id(progress_id).await
    }

    async fn find_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<Option<ProgressRecord>> {
        self.progress_by_key(user_id, event_id, level_id).await
    }

    async fn insert_progress(&self, new: &NewProgress) -> Result<(ProgressRecord, bool)> {
        self.insert_or_fetch_progress(new).await
    }

    async fn complete_progress(&self, completion: &Completion) -> Result<Option<ProgressRecord>> {
        self.complete_if_in_progress(completion).await
    }

    async fn save_game_state(
        &self,
        progress_id: ProgressId,
        user_id: UserId,
        game_state: &serde_json::Value,
    ) -> Result<Option<ProgressRecord>> {
        self.set_game_state(progress_id, user_id, game_state).await
    }

    async fn passed_progress(&self, event_id: EventId) -> Result<Vec<ProgressRecord>> {
        self.passed_for_event(event_id).await
    }

    async fn count_participants(&self, event_id: EventId) -> Result<i64> {
        self.participant_count(event_id).await
    }

    async fn expire_stale_progress(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>> {
        self.fail_stale_progress(cutoff, now).await
    }

    async fn health_check(&self) -> Result<()> {
        Database::health_check(self).await
    }
}
