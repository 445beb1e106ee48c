//! # Store — Storage Seam for Catalog, Identity, and Progress
//!
//! `ProgressStore` is the single interface the engine talks to. Two
//! implementations exist: [`crate::db::Database`] (PostgreSQL via sqlx) and
//! [`crate::memory::MemoryStore`] (in-process, used by tests and
//! `serve --memory`).
//!
//! ## Atomicity contract
//!
//! Implementations must provide two atomic primitives; the tracker builds its
//! guarantees on top of them:
//!
//! - [`ProgressStore::insert_progress`] is create-or-fetch on the
//!   `(user_id, event_id, level_id)` key. Concurrent callers all observe the
//!   same record and exactly one sees `created = true`.
//! - [`ProgressStore::complete_progress`] is a conditional transition that
//!   only applies while the record is `in_progress` and owned by the caller.
//!   Concurrent callers with the same `progress_id` get `Some` exactly once.
//!
//! Writes for different users must never wait on each other.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Completion, Event, EventId, Level, LevelId, NewProgress, ProgressId, ProgressRecord, User,
    UserId,
};

#[async_trait]
pub trait ProgressStore: Send + Sync {
    // ── Catalog ────────────────────────────────────────────────

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>>;

    async fn get_event_by_qr(&self, qr_token: &str) -> Result<Option<Event>>;

    /// Enabled levels of an event, sorted by `level_order`.
    async fn get_levels(&self, event_id: EventId) -> Result<Vec<Level>>;

    /// Members of a named group within an event, or `None` if the group
    /// does not exist.
    async fn get_group_members(&self, event_id: EventId, group: &str)
        -> Result<Option<Vec<UserId>>>;

    // ── Identity ───────────────────────────────────────────────

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    async fn get_users(&self, user_ids: &[UserId]) -> Result<Vec<User>>;

    async fn get_user_by_phone(&self, phone_number: &str) -> Result<Option<User>>;

    /// Create a user for `phone_number`, or return the existing one if a
    /// concurrent verification created it first.
    async fn create_user(&self, phone_number: &str, display_name: &str) -> Result<User>;

    async fn update_display_name(&self, user_id: UserId, display_name: &str)
        -> Result<Option<User>>;

    /// Store a new OTP challenge and invalidate earlier unconsumed ones for
    /// the same phone number.
    async fn store_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically consume a matching, unexpired challenge. Returns `false`
    /// when none matches.
    async fn consume_otp(&self, phone_number: &str, code_hash: &str, now: DateTime<Utc>)
        -> Result<bool>;

    // ── Progress ───────────────────────────────────────────────

    async fn list_progress(&self, user_id: UserId, event_id: EventId)
        -> Result<Vec<ProgressRecord>>;

    async fn get_progress(&self, progress_id: ProgressId) -> Result<Option<ProgressRecord>>;

    async fn find_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<Option<ProgressRecord>>;

    /// Create-or-fetch on `(user_id, event_id, level_id)`. Returns the stored
    /// record and whether this call created it.
    async fn insert_progress(&self, new: &NewProgress) -> Result<(ProgressRecord, bool)>;

    /// Apply `completion` only if the record is still `in_progress` and owned
    /// by `completion.user_id`. Returns the updated record, or `None` if the
    /// condition did not hold.
    async fn complete_progress(&self, completion: &Completion) -> Result<Option<ProgressRecord>>;

    /// Overwrite the saved game state of an `in_progress` record owned by
    /// `user_id`. Returns `None` if the condition did not hold.
    async fn save_game_state(
        &self,
        progress_id: ProgressId,
        user_id: UserId,
        game_state: &serde_json::Value,
    ) -> Result<Option<ProgressRecord>>;

    /// All passed records for an event, in any order.
    async fn passed_progress(&self, event_id: EventId) -> Result<Vec<ProgressRecord>>;

    /// Number of distinct users with any record for the event.
    async fn count_participants(&self, event_id: EventId) -> Result<i64>;

    /// Fail every `in_progress` record started before `cutoff`, stamping
    /// `completed_at = now` and a timeout reason. Returns the expired records.
    async fn expire_stale_progress(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>>;

    async fn health_check(&self) -> Result<()>;
}

/// Result payload written onto attempts failed by the stale sweeper.
pub fn timeout_result() -> serde_json::Value {
    serde_json::json!({ "reason": "timeout" })
}
