//! # Tracker — Per-User Level Progress State Machine
//!
//! Owns every write to progress records. Two guarantees rest on the store's
//! atomic primitives (see [`crate::store`]):
//!
//! - **Idempotent start.** Starting a level that is already in progress
//!   returns the existing `progress_id` and keeps the original `started_at`.
//!   Concurrent starts for the same `(user, event, level)` converge on one
//!   record.
//! - **Single-writer completion.** A `progress_id` transitions out of
//!   `in_progress` exactly once. Losers of a race see `InvalidProgressId`.
//!
//! Levels are strictly sequential: a level may only be started once the
//! previous enabled level (by `level_order`) has been passed.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::leaderboard::LeaderboardAggregator;
use crate::model::{
    next_level, previous_level, Completion, Event, EventId, Level, LevelId, NewProgress, Outcome,
    ProgressId, ProgressRecord, ProgressState, UserId,
};
use crate::prom_metrics::{Metrics, OutcomeLabel};
use crate::retry::RetryPolicy;
use crate::store::ProgressStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub progress_id: ProgressId,
    pub event_id: EventId,
    pub level_id: LevelId,
    pub state: ProgressState,
    pub started_at: DateTime<Utc>,
    /// True when an existing in-progress attempt was returned.
    pub resumed: bool,
    /// Snapshot saved by the client during the attempt, if any.
    pub game_state: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOutcome {
    pub progress_id: ProgressId,
    pub state: ProgressState,
    pub completed_at: DateTime<Utc>,
    pub time_taken_seconds: i64,
    pub rank: Option<usize>,
    pub next_level: Option<Level>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Locked,
    NotStarted,
    InProgress,
    Passed,
    Failed,
}

/// A level annotated with one user's progress on it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelView {
    pub level_id: LevelId,
    pub level_order: i32,
    pub game_type: String,
    pub is_final: bool,
    pub pass_criteria: Option<Value>,
    pub is_unlocked: bool,
    pub status: LevelStatus,
    pub progress_id: Option<ProgressId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_taken_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub event_id: EventId,
    pub total_levels: usize,
    pub completed_levels: usize,
    /// Order of the first level not yet passed, `None` once all are passed.
    pub current_level_order: Option<i32>,
    pub all_completed: bool,
    pub total_time_seconds: i64,
    pub first_activity_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub levels: Vec<LevelView>,
}

/// Annotate `levels` (enabled, in order) with `records`. A level is unlocked
/// when it is first or its predecessor is passed.
pub fn level_views(levels: &[Level], records: &[ProgressRecord]) -> Vec<LevelView> {
    let mut prev_passed = true;
    levels
        .iter()
        .map(|level| {
            let record = records.iter().find(|r| r.level_id == level.level_id);
            let is_unlocked = prev_passed;
            let status = match record.map(|r| r.state) {
                Some(ProgressState::InProgress) => LevelStatus::InProgress,
                Some(ProgressState::Completed(Outcome::Passed)) => LevelStatus::Passed,
                Some(ProgressState::Completed(Outcome::Failed)) => LevelStatus::Failed,
                Some(ProgressState::NotStarted) | None if is_unlocked => LevelStatus::NotStarted,
                Some(ProgressState::NotStarted) | None => LevelStatus::Locked,
            };
            prev_passed = status == LevelStatus::Passed;
            LevelView {
                level_id: level.level_id,
                level_order: level.level_order,
                game_type: level.game_type.clone(),
                is_final: level.is_final,
                pass_criteria: level.pass_criteria.clone(),
                is_unlocked,
                status,
                progress_id: record.map(|r| r.progress_id),
                started_at: record.map(|r| r.started_at),
                completed_at: record.and_then(|r| r.completed_at),
                time_taken_seconds: record.and_then(|r| r.time_taken_seconds),
            }
        })
        .collect()
}

pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    leaderboard: Arc<LeaderboardAggregator>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        leaderboard: Arc<LeaderboardAggregator>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            leaderboard,
            retry,
            metrics,
        }
    }

    async fn event_levels(&self, event_id: EventId) -> Result<(Event, Vec<Level>), EngineError> {
        let event = self
            .retry
            .run("get_event", || self.store.get_event(event_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))?;
        let levels = self
            .retry
            .run("get_levels", || self.store.get_levels(event_id))
            .await?;
        Ok((event, levels))
    }

    /// All records this user has for the event. Untouched levels have no
    /// record and are implicitly not started.
    pub async fn get_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Vec<ProgressRecord>, EngineError> {
        self.event_levels(event_id).await?;
        self.retry
            .run("list_progress", || self.store.list_progress(user_id, event_id))
            .await
    }

    pub async fn start_level(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
        device_info: Option<Value>,
    ) -> Result<StartOutcome, EngineError> {
        let (_, levels) = self.event_levels(event_id).await?;
        if !levels.iter().any(|l| l.level_id == level_id) {
            return Err(EngineError::NotFound(format!(
                "level {} in event {}",
                level_id, event_id
            )));
        }

        if let Some(prev) = previous_level(&levels, level_id) {
            let prev_record = self
                .retry
                .run("find_progress", || {
                    self.store.find_progress(user_id, event_id, prev.level_id)
                })
                .await?;
            if !prev_record.is_some_and(|r| r.state.is_passed()) {
                return Err(EngineError::SequenceViolation {
                    level_id,
                    previous_level_id: prev.level_id,
                });
            }
        }

        let existing = self
            .retry
            .run("find_progress", || self.store.find_progress(user_id, event_id, level_id))
            .await?;
        if let Some(record) = existing {
            return self.resume_or_reject(record);
        }

        let new = NewProgress {
            progress_id: uuid::Uuid::new_v4(),
            user_id,
            event_id,
            level_id,
            started_at: Utc::now(),
            device_info,
        };
        let (record, created) = self
            .retry
            .run("insert_progress", || self.store.insert_progress(&new))
            .await?;
        if !created {
            // Lost a race with a concurrent start for the same level.
            return self.resume_or_reject(record);
        }

        self.metrics.levels_started.inc();
        info!(
            user_id = %user_id,
            event_id,
            level_id,
            progress_id = %record.progress_id,
            "level started"
        );
        Ok(StartOutcome {
            progress_id: record.progress_id,
            event_id,
            level_id,
            state: record.state,
            started_at: record.started_at,
            resumed: false,
            game_state: None,
        })
    }

    fn resume_or_reject(&self, record: ProgressRecord) -> Result<StartOutcome, EngineError> {
        match record.state {
            ProgressState::Completed(_) => Err(EngineError::AlreadyCompleted {
                level_id: record.level_id,
                progress_id: record.progress_id,
            }),
            _ => {
                self.metrics.start_replays.inc();
                Ok(StartOutcome {
                    progress_id: record.progress_id,
                    event_id: record.event_id,
                    level_id: record.level_id,
                    state: record.state,
                    started_at: record.started_at,
                    resumed: true,
                    game_state: record.game_state,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete_level(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
        progress_id: ProgressId,
        result_data: Value,
        is_passed: bool,
        device_info: Option<Value>,
    ) -> Result<CompleteOutcome, EngineError> {
        let record = self
            .retry
            .run("get_progress", || self.store.get_progress(progress_id))
            .await?
            .ok_or(EngineError::InvalidProgressId(progress_id))?;
        if record.user_id != user_id {
            return Err(EngineError::Forbidden(progress_id));
        }
        if record.event_id != event_id
            || record.level_id != level_id
            || record.state != ProgressState::InProgress
        {
            return Err(EngineError::InvalidProgressId(progress_id));
        }

        let outcome = Outcome::from_passed(is_passed);
        // Postgres keeps microseconds; a finer timestamp would never match
        // the stored one when checking whether a retried write committed.
        let completed_at = Utc::now().trunc_subsecs(6);
        let completion = Completion {
            progress_id,
            user_id,
            outcome,
            completed_at,
            time_taken_seconds: (completed_at - record.started_at).num_seconds().max(0),
            result_data,
            device_info,
        };
        let updated = match self
            .retry
            .run("complete_progress", || self.store.complete_progress(&completion))
            .await?
        {
            Some(updated) => updated,
            None => {
                // A retried write may have committed on an earlier attempt;
                // only our own timestamp proves that.
                self.retry
                    .run("get_progress", || self.store.get_progress(progress_id))
                    .await?
                    .filter(|r| r.state.is_terminal() && r.completed_at == Some(completed_at))
                    .ok_or(EngineError::InvalidProgressId(progress_id))?
            }
        };

        self.metrics
            .levels_completed
            .get_or_create(&OutcomeLabel::from(outcome))
            .inc();
        info!(
            user_id = %user_id,
            event_id,
            level_id,
            progress_id = %progress_id,
            passed = is_passed,
            time_taken_seconds = completion.time_taken_seconds,
            "level completed"
        );

        // The record is committed; a standings hiccup must not turn it into
        // an error the client would retry into InvalidProgressId.
        if let Err(e) = self.leaderboard.record_completion(&updated).await {
            warn!(progress_id = %progress_id, error = %e, "standings update failed");
        }

        let rank = match self.leaderboard.get_my_rank(event_id, user_id).await {
            Ok(my) => Some(my.rank),
            Err(EngineError::NotFound(_)) => None,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "rank lookup after completion failed");
                None
            }
        };

        let next = if is_passed {
            match self
                .retry
                .run("get_levels", || self.store.get_levels(event_id))
                .await
            {
                Ok(levels) => next_level(&levels, level_id).cloned(),
                Err(e) => {
                    warn!(event_id, error = %e, "next level lookup after completion failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(CompleteOutcome {
            progress_id,
            state: updated.state,
            completed_at: updated.completed_at.unwrap_or(completed_at),
            time_taken_seconds: updated.time_taken_seconds.unwrap_or(completion.time_taken_seconds),
            rank,
            next_level: next,
        })
    }

    /// Store a mid-level snapshot so the attempt can be resumed later. Only
    /// the owner's open attempt for this level accepts it.
    pub async fn save_game_state(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
        progress_id: ProgressId,
        game_state: Value,
    ) -> Result<ProgressRecord, EngineError> {
        let record = self
            .retry
            .run("get_progress", || self.store.get_progress(progress_id))
            .await?
            .ok_or(EngineError::InvalidProgressId(progress_id))?;
        if record.user_id != user_id {
            return Err(EngineError::Forbidden(progress_id));
        }
        if record.event_id != event_id || record.level_id != level_id {
            return Err(EngineError::InvalidProgressId(progress_id));
        }
        self.retry
            .run("save_game_state", || {
                self.store.save_game_state(progress_id, user_id, &game_state)
            })
            .await?
            .ok_or(EngineError::InvalidProgressId(progress_id))
    }

    /// Resolve a QR token to an event. Inactive events are `Gone`.
    pub async fn event_by_qr(&self, qr_token: &str) -> Result<Event, EngineError> {
        let event = self
            .retry
            .run("get_event_by_qr", || self.store.get_event_by_qr(qr_token))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event for QR code {}", qr_token)))?;
        if !event.is_active {
            return Err(EngineError::Gone(format!("event {}", event.event_id)));
        }
        Ok(event)
    }

    /// Enabled levels of an event, annotated with the caller's progress.
    /// Anonymous callers see every level untouched.
    pub async fn level_views(
        &self,
        user_id: Option<UserId>,
        event_id: EventId,
    ) -> Result<Vec<LevelView>, EngineError> {
        let (_, levels) = self.event_levels(event_id).await?;
        let records = match user_id {
            Some(user_id) => {
                self.retry
                    .run("list_progress", || self.store.list_progress(user_id, event_id))
                    .await?
            }
            None => Vec::new(),
        };
        Ok(level_views(&levels, &records))
    }

    /// One enabled level with the caller's status on it.
    pub async fn level_view(
        &self,
        user_id: Option<UserId>,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<LevelView, EngineError> {
        self.level_views(user_id, event_id)
            .await?
            .into_iter()
            .find(|v| v.level_id == level_id)
            .ok_or_else(|| {
                EngineError::NotFound(format!("level {} in event {}", level_id, event_id))
            })
    }

    /// The caller's attempts at one level. At most one record exists per
    /// level, so this is empty or a single attempt.
    pub async fn level_attempts(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<Vec<ProgressRecord>, EngineError> {
        let (_, levels) = self.event_levels(event_id).await?;
        if !levels.iter().any(|l| l.level_id == level_id) {
            return Err(EngineError::NotFound(format!(
                "level {} in event {}",
                level_id, event_id
            )));
        }
        let record = self
            .retry
            .run("find_progress", || self.store.find_progress(user_id, event_id, level_id))
            .await?;
        Ok(record.into_iter().collect())
    }

    pub async fn progress_summary(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<ProgressSummary, EngineError> {
        let (_, levels) = self.event_levels(event_id).await?;
        let records = self
            .retry
            .run("list_progress", || self.store.list_progress(user_id, event_id))
            .await?;
        let views = level_views(&levels, &records);

        let completed_levels = views
            .iter()
            .filter(|v| v.status == LevelStatus::Passed)
            .count();
        let current_level_order = views
            .iter()
            .find(|v| v.status != LevelStatus::Passed)
            .map(|v| v.level_order);
        let first_activity_at = records.iter().map(|r| r.started_at).min();
        let last_activity_at = records
            .iter()
            .map(|r| r.completed_at.unwrap_or(r.started_at))
            .max();
        let total_time_seconds = records.iter().filter_map(|r| r.time_taken_seconds).sum();

        Ok(ProgressSummary {
            event_id,
            total_levels: views.len(),
            completed_levels,
            current_level_order,
            all_completed: !views.is_empty() && completed_levels == views.len(),
            total_time_seconds,
            first_activity_at,
            last_activity_at,
            levels: views,
        })
    }

    /// Fail every in-progress attempt started more than `max_age` ago.
    pub async fn expire_stale_attempts(
        &self,
        max_age: chrono::Duration,
    ) -> Result<Vec<ProgressRecord>, EngineError> {
        let now = Utc::now();
        let cutoff = now - max_age;
        let expired = self
            .retry
            .run("expire_stale_progress", || {
                self.store.expire_stale_progress(cutoff, now)
            })
            .await?;
        for record in &expired {
            if let Err(e) = self.leaderboard.record_completion(record).await {
                warn!(progress_id = %record.progress_id, error = %e, "standings update failed");
            }
        }
        if !expired.is_empty() {
            self.metrics.stale_expired.inc_by(expired.len() as u64);
            info!(count = expired.len(), cutoff = %cutoff, "expired stale attempts");
        }
        Ok(expired)
    }
}
