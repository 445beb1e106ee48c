//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::OnceCell;
use utsav::auth::OtpSender;
use utsav::config::{EngineConfig, StandingsStrategy};
use utsav::memory::MemoryStore;
use utsav::model::{
    Completion, Event, EventId, Level, LevelId, NewProgress, ProgressId, ProgressRecord, User,
    UserId,
};
use utsav::server::{self, AppState};
use utsav::store::ProgressStore;

// ── In-memory app ───────────────────────────────────────────────

/// OTP sender that remembers every code instead of delivering it.
#[derive(Default)]
pub struct CapturingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl CapturingSender {
    pub fn last_code_for(&self, phone_number: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(phone, _)| phone == phone_number)
            .map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl OtpSender for CapturingSender {
    async fn send(&self, phone_number: &str, code: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((phone_number.to_string(), code.to_string()));
        Ok(())
    }
}

pub fn test_config(strategy: StandingsStrategy) -> EngineConfig {
    EngineConfig {
        jwt_secret: "integration-test-secret".to_string(),
        leaderboard_strategy: strategy,
        retry_delay_ms: 1,
        ..Default::default()
    }
}

/// A memory-backed app with one active event (`qr_token = "TEST"`) holding
/// three enabled levels.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub sender: Arc<CapturingSender>,
    pub event: Event,
    pub levels: Vec<Level>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_strategy(StandingsStrategy::OnRead)
    }

    pub fn with_strategy(strategy: StandingsStrategy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let event = store.add_event("Test Event", "TEST");
        let levels = vec![
            store.add_level(event.event_id, 1, "memory", false),
            store.add_level(event.event_id, 2, "puzzle", false),
            store.add_level(event.event_id, 3, "quiz", true),
        ];
        let sender = Arc::new(CapturingSender::default());
        let state = AppState::build_with_sender(store.clone(), test_config(strategy), sender.clone());
        Self {
            state,
            store,
            sender,
            event,
            levels,
        }
    }

    pub fn router(&self) -> axum::Router {
        server::build_router(self.state.clone())
    }

    pub fn level_id(&self, order: usize) -> i64 {
        self.levels[order - 1].level_id
    }

    /// Create a user directly in the store and mint a bearer token for it.
    pub fn sign_in(&self, phone_number: &str, name: &str) -> (User, String) {
        let user = self.store.add_user(phone_number, name);
        let token = self.state.identity.jwt().create_token(&user).unwrap();
        (user, token)
    }
}

// ── Fault injection ─────────────────────────────────────────────

/// Store wrapper that injects the failures a networked database produces.
///
/// Timestamps are cut to microseconds on the way in, as `TIMESTAMPTZ` does.
/// With `lose_next_ack` set, the next completion commits and then reports a
/// dropped connection, so the caller's retry finds its own write already
/// applied. With `fail_levels` set, level lookups fail outright.
pub struct FlakyStore {
    pub inner: Arc<dyn ProgressStore>,
    pub lose_next_ack: AtomicBool,
    pub fail_levels: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ProgressStore>) -> Self {
        Self {
            inner,
            lose_next_ack: AtomicBool::new(false),
            fail_levels: AtomicBool::new(false),
        }
    }
}

fn connection_reset() -> anyhow::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
    .into()
}

#[async_trait]
impl ProgressStore for FlakyStore {
    async fn get_event(&self, event_id: EventId) -> anyhow::Result<Option<Event>> {
        self.inner.get_event(event_id).await
    }

    async fn get_event_by_qr(&self, qr_token: &str) -> anyhow::Result<Option<Event>> {
        self.inner.get_event_by_qr(qr_token).await
    }

    async fn get_levels(&self, event_id: EventId) -> anyhow::Result<Vec<Level>> {
        if self.fail_levels.load(Ordering::SeqCst) {
            anyhow::bail!("catalog query failed");
        }
        self.inner.get_levels(event_id).await
    }

    async fn get_group_members(
        &self,
        event_id: EventId,
        group: &str,
    ) -> anyhow::Result<Option<Vec<UserId>>> {
        self.inner.get_group_members(event_id, group).await
    }

    async fn get_user(&self, user_id: UserId) -> anyhow::Result<Option<User>> {
        self.inner.get_user(user_id).await
    }

    async fn get_users(&self, user_ids: &[UserId]) -> anyhow::Result<Vec<User>> {
        self.inner.get_users(user_ids).await
    }

    async fn get_user_by_phone(&self, phone_number: &str) -> anyhow::Result<Option<User>> {
        self.inner.get_user_by_phone(phone_number).await
    }

    async fn create_user(&self, phone_number: &str, display_name: &str) -> anyhow::Result<User> {
        self.inner.create_user(phone_number, display_name).await
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> anyhow::Result<Option<User>> {
        self.inner.update_display_name(user_id, display_name).await
    }

    async fn store_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.inner.store_otp(phone_number, code_hash, expires_at).await
    }

    async fn consume_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.inner.consume_otp(phone_number, code_hash, now).await
    }

    async fn list_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> anyhow::Result<Vec<ProgressRecord>> {
        self.inner.list_progress(user_id, event_id).await
    }

    async fn get_progress(&self, progress_id: ProgressId) -> anyhow::Result<Option<ProgressRecord>> {
        self.inner.get_progress(progress_id).await
    }

    async fn find_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> anyhow::Result<Option<ProgressRecord>> {
        self.inner.find_progress(user_id, event_id, level_id).await
    }

    async fn insert_progress(&self, new: &NewProgress) -> anyhow::Result<(ProgressRecord, bool)> {
        let mut new = new.clone();
        new.started_at = new.started_at.trunc_subsecs(6);
        self.inner.insert_progress(&new).await
    }

    async fn complete_progress(
        &self,
        completion: &Completion,
    ) -> anyhow::Result<Option<ProgressRecord>> {
        let mut completion = completion.clone();
        completion.completed_at = completion.completed_at.trunc_subsecs(6);
        let applied = self.inner.complete_progress(&completion).await?;
        if self.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(connection_reset());
        }
        Ok(applied)
    }

    async fn save_game_state(
        &self,
        progress_id: ProgressId,
        user_id: UserId,
        game_state: &serde_json::Value,
    ) -> anyhow::Result<Option<ProgressRecord>> {
        self.inner.save_game_state(progress_id, user_id, game_state).await
    }

    async fn passed_progress(&self, event_id: EventId) -> anyhow::Result<Vec<ProgressRecord>> {
        self.inner.passed_progress(event_id).await
    }

    async fn count_participants(&self, event_id: EventId) -> anyhow::Result<i64> {
        self.inner.count_participants(event_id).await
    }

    async fn expire_stale_progress(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ProgressRecord>> {
        self.inner.expire_stale_progress(cutoff, now).await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        self.inner.health_check().await
    }
}

// ── Database ────────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Apply the schema once per test binary. Async so it runs on the calling
/// test's runtime instead of nesting a second one inside it.
pub async fn ensure_schema() {
    SCHEMA_INIT
        .get_or_init(|| async {
            let db = utsav::db::Database::connect_with(&test_db_url(), 1)
                .await
                .expect("Failed to connect to test database");
            db.migrate().await.expect("Failed to apply schema");
        })
        .await;
}

/// Blocking variant for synchronous tests (CLI tests).
pub fn ensure_schema_blocking() {
    tokio::runtime::Runtime::new()
        .expect("Failed to build runtime")
        .block_on(ensure_schema());
}

/// Connect to the test database with every table emptied.
pub async fn setup_test_db() -> utsav::db::Database {
    ensure_schema().await;
    let db = utsav::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE level_progress, otp_challenges, event_group_members, event_groups,
                        event_levels, events, users
         CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}
