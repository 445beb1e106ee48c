//! # Model — Users, Catalog, and Progress Records
//!
//! Plain data types shared by the storage backends, the progress tracker, and
//! the leaderboard. Events and levels come from the catalog and are read-only
//! here; `ProgressRecord` is the system of record for gameplay.
//!
//! ## Progress state machine
//!
//! ```text
//! NotStarted --start--> InProgress --complete(pass)--> Completed(Passed)
//!                                  --complete(fail)--> Completed(Failed)
//! ```
//!
//! `NotStarted` is never stored: a level without a record is implicitly not
//! started. Storage encodes the remaining states as `in_progress`, `passed`
//! and `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type UserId = uuid::Uuid;
pub type ProgressId = uuid::Uuid;
pub type EventId = i64;
pub type LevelId = i64;

// ── Identity ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: UserId,
    pub phone_number: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Catalog ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: EventId,
    pub name: String,
    pub qr_token: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One stage of an event. `level_order` is unique per event; the pass
/// criteria are evaluated by the level's own game logic and are opaque here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub level_id: LevelId,
    pub event_id: EventId,
    pub level_order: i32,
    pub game_type: String,
    pub pass_criteria: Option<Value>,
    pub is_final: bool,
    pub is_enabled: bool,
}

/// The level that must be passed before `level_id` may be started, given the
/// event's enabled levels sorted by `level_order`.
///
/// Returns `None` both for the first level and for a level not in `levels`.
pub fn previous_level(levels: &[Level], level_id: LevelId) -> Option<&Level> {
    let idx = levels.iter().position(|l| l.level_id == level_id)?;
    idx.checked_sub(1).map(|prev| &levels[prev])
}

/// The level that follows `level_id` in sequence, if any.
pub fn next_level(levels: &[Level], level_id: LevelId) -> Option<&Level> {
    let idx = levels.iter().position(|l| l.level_id == level_id)?;
    levels.get(idx + 1)
}

// ── Progress ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
}

impl Outcome {
    pub fn from_passed(is_passed: bool) -> Self {
        if is_passed {
            Outcome::Passed
        } else {
            Outcome::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "outcome", rename_all = "snake_case")]
pub enum ProgressState {
    NotStarted,
    InProgress,
    Completed(Outcome),
}

impl ProgressState {
    /// Storage encoding. `NotStarted` has no row, so it maps to `None`.
    pub fn as_db_str(&self) -> Option<&'static str> {
        match self {
            ProgressState::NotStarted => None,
            ProgressState::InProgress => Some("in_progress"),
            ProgressState::Completed(Outcome::Passed) => Some("passed"),
            ProgressState::Completed(Outcome::Failed) => Some("failed"),
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(ProgressState::InProgress),
            "passed" => Some(ProgressState::Completed(Outcome::Passed)),
            "failed" => Some(ProgressState::Completed(Outcome::Failed)),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressState::Completed(_))
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, ProgressState::Completed(Outcome::Passed))
    }
}

/// Durable state of one user's attempt at one level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub progress_id: ProgressId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub level_id: LevelId,
    pub state: ProgressState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_taken_seconds: Option<i64>,
    pub result_data: Option<Value>,
    pub device_info: Option<Value>,
    /// Client snapshot saved mid-level so an interrupted attempt can resume.
    pub game_state: Option<Value>,
}

/// Insert request for a fresh `InProgress` record.
#[derive(Debug, Clone)]
pub struct NewProgress {
    pub progress_id: ProgressId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub level_id: LevelId,
    pub started_at: DateTime<Utc>,
    pub device_info: Option<Value>,
}

/// Terminal transition for an `InProgress` record.
///
/// `completed_at` must already be at storage precision (microseconds) so a
/// retried write can recognise its own committed row.
#[derive(Debug, Clone)]
pub struct Completion {
    pub progress_id: ProgressId,
    pub user_id: UserId,
    pub outcome: Outcome,
    pub completed_at: DateTime<Utc>,
    pub time_taken_seconds: i64,
    pub result_data: Value,
    pub device_info: Option<Value>,
}
