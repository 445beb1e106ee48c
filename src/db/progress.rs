//! Progress records — create-or-fetch start, conditional completion, scans.
//!
//! `state` is stored as text (`in_progress`, `passed`, `failed`) and decoded
//! through [`ProgressState::from_db_str`]; an unknown value is a hard error,
//! never silently mapped.

use super::Database;
use crate::model::{
    Completion, EventId, LevelId, NewProgress, ProgressId, ProgressRecord, ProgressState, UserId,
};
use crate::store::timeout_result;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

const PROGRESS_COLUMNS: &str = "progress_id, user_id, event_id, level_id, state, started_at, \
     completed_at, time_taken_seconds, result_data, device_info, game_state";

#[derive(sqlx::FromRow)]
struct ProgressRow {
    progress_id: ProgressId,
    user_id: UserId,
    event_id: EventId,
    level_id: LevelId,
    state: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    time_taken_seconds: Option<i64>,
    result_data: Option<Value>,
    device_info: Option<Value>,
    game_state: Option<Value>,
}

impl TryFrom<ProgressRow> for ProgressRecord {
    type Error = anyhow::Error;

    fn try_from(row: ProgressRow) -> Result<Self> {
        let state = ProgressState::from_db_str(&row.state).ok_or_else(|| {
            anyhow::anyhow!("progress {} has unknown state '{}'", row.progress_id, row.state)
        })?;
        Ok(ProgressRecord {
            progress_id: row.progress_id,
            user_id: row.user_id,
            event_id: row.event_id,
            level_id: row.level_id,
            state,
            started_at: row.started_at,
            completed_at: row.completed_at,
            time_taken_seconds: row.time_taken_seconds,
            result_data: row.result_data,
            device_info: row.device_info,
            game_state: row.game_state,
        })
    }
}

fn decode_all(rows: Vec<ProgressRow>) -> Result<Vec<ProgressRecord>> {
    rows.into_iter().map(ProgressRecord::try_from).collect()
}

fn decode_opt(row: Option<ProgressRow>) -> Result<Option<ProgressRecord>> {
    row.map(ProgressRecord::try_from).transpose()
}

impl Database {
    pub(super) async fn progress_for_user(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {} FROM level_progress
             WHERE user_id = $1 AND event_id = $2
             ORDER BY started_at ASC",
            PROGRESS_COLUMNS
        ))
        .bind(user_id)
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    pub(super) async fn progress_by_id(
        &self,
        progress_id: ProgressId,
    ) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {} FROM level_progress WHERE progress_id = $1",
            PROGRESS_COLUMNS
        ))
        .bind(progress_id)
        .fetch_optional(&self.pool)
        .await?;
        decode_opt(row)
    }

    pub(super) async fn progress_by_key(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {} FROM level_progress
             WHERE user_id = $1 AND event_id = $2 AND level_id = $3",
            PROGRESS_COLUMNS
        ))
        .bind(user_id)
        .bind(event_id)
        .bind(level_id)
        .fetch_optional(&self.pool)
        .await?;
        decode_opt(row)
    }

    /// Insert an `in_progress` row; on a unique-key conflict fetch the row
    /// that won instead.
    pub(super) async fn insert_or_fetch_progress(
        &self,
        new: &NewProgress,
    ) -> Result<(ProgressRecord, bool)> {
        let inserted = sqlx::query_as::<_, ProgressRow>(&format!(
            "INSERT INTO level_progress
               (progress_id, user_id, event_id, level_id, state, started_at, device_info)
             VALUES ($1, $2, $3, $4, 'in_progress', $5, $6)
             ON CONFLICT (user_id, event_id, level_id) DO NOTHING
             RETURNING {}",
            PROGRESS_COLUMNS
        ))
        .bind(new.progress_id)
        .bind(new.user_id)
        .bind(new.event_id)
        .bind(new.level_id)
        .bind(new.started_at)
        .bind(&new.device_info)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }
        let existing = self
            .progress_by_key(new.user_id, new.event_id, new.level_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "progress for level {} conflicted but is missing",
                    new.level_id
                )
            })?;
        // A retried insert whose first attempt committed finds its own row.
        let created = existing.progress_id == new.progress_id;
        Ok((existing, created))
    }

    pub(super) async fn complete_if_in_progress(
        &self,
        completion: &Completion,
    ) -> Result<Option<ProgressRecord>> {
        let state = ProgressState::Completed(completion.outcome)
            .as_db_str()
            .ok_or_else(|| anyhow::anyhow!("completion without a storable state"))?;
        let row = sqlx::query_as::<_, ProgressRow>(&format!(
            "UPDATE level_progress
             SET state = $3,
                 completed_at = $4,
                 time_taken_seconds = $5,
                 result_data = $6,
                 device_info = COALESCE($7, device_info)
             WHERE progress_id = $1 AND user_id = $2 AND state = 'in_progress'
             RETURNING {}",
            PROGRESS_COLUMNS
        ))
        .bind(completion.progress_id)
        .bind(completion.user_id)
        .bind(state)
        .bind(completion.completed_at)
        .bind(completion.time_taken_seconds)
        .bind(&completion.result_data)
        .bind(&completion.device_info)
        .fetch_optional(&self.pool)
        .await?;
        decode_opt(row)
    }

    pub(super) async fn set_game_state(
        &self,
        progress_id: ProgressId,
        user_id: UserId,
        game_state: &Value,
    ) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query_as::<_, ProgressRow>(&format!(
            "UPDATE level_progress
             SET game_state = $3
             WHERE progress_id = $1 AND user_id = $2 AND state = 'in_progress'
             RETURNING {}",
            PROGRESS_COLUMNS
        ))
        .bind(progress_id)
        .bind(user_id)
        .bind(game_state)
        .fetch_optional(&self.pool)
        .await?;
        decode_opt(row)
    }

    pub(super) async fn passed_for_event(&self, event_id: EventId) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(&format!(
            "SELECT {} FROM level_progress WHERE event_id = $1 AND state = 'passed'",
            PROGRESS_COLUMNS
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    pub(super) async fn participant_count(&self, event_id: EventId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT user_id) FROM level_progress WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub(super) async fn fail_stale_progress(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(&format!(
            "UPDATE level_progress
             SET state = 'failed',
                 completed_at = $2,
                 time_taken_seconds = GREATEST(0, EXTRACT(EPOCH FROM ($2 - started_at))::BIGINT),
                 result_data = $3
             WHERE state = 'in_progress' AND started_at < $1
             RETURNING {}",
            PROGRESS_COLUMNS
        ))
        .bind(cutoff)
        .bind(now)
        .bind(timeout_result())
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;

    fn row(state: &str) -> ProgressRow {
        ProgressRow {
            progress_id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            event_id: 1,
            level_id: 2,
            state: state.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            time_taken_seconds: None,
            result_data: None,
            device_info: None,
            game_state: None,
        }
    }

    #[test]
    fn row_decodes_known_states() {
        let record = ProgressRecord::try_from(row("passed")).unwrap();
        assert_eq!(record.state, ProgressState::Completed(Outcome::Passed));
        let record = ProgressRecord::try_from(row("in_progress")).unwrap();
        assert_eq!(record.state, ProgressState::InProgress);
    }

    #[test]
    fn row_rejects_unknown_state() {
        assert!(ProgressRecord::try_from(row("completed")).is_err());
    }
}
