//! Catalog reads — events, levels, groups.
//!
//! The engine never edits the catalog at runtime. The `insert_*` helpers exist
//! for seeding (tests, demo data).

use super::Database;
use crate::model::{Event, EventId, Level, UserId};
use anyhow::Result;
use serde_json::Value;

const EVENT_COLUMNS: &str = "event_id, name, qr_token, is_active, description, created_at";
const LEVEL_COLUMNS: &str =
    "level_id, event_id, level_order, game_type, pass_criteria, is_final, is_enabled";

impl Database {
    pub(super) async fn event_by_id(&self, event_id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {} FROM events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    pub(super) async fn event_by_qr(&self, qr_token: &str) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {} FROM events WHERE qr_token = $1",
            EVENT_COLUMNS
        ))
        .bind(qr_token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    pub(super) async fn enabled_levels(&self, event_id: EventId) -> Result<Vec<Level>> {
        let levels = sqlx::query_as::<_, Level>(&format!(
            "SELECT {} FROM event_levels
             WHERE event_id = $1 AND is_enabled
             ORDER BY level_order ASC",
            LEVEL_COLUMNS
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(levels)
    }

    /// `None` when the group is not defined for the event; an empty vec when
    /// it exists without members.
    pub(super) async fn group_members(
        &self,
        event_id: EventId,
        group: &str,
    ) -> Result<Option<Vec<UserId>>> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM event_groups WHERE event_id = $1 AND group_name = $2)",
        )
        .bind(event_id)
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Ok(None);
        }
        let members: Vec<UserId> = sqlx::query_scalar(
            "SELECT user_id FROM event_group_members WHERE event_id = $1 AND group_name = $2",
        )
        .bind(event_id)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(members))
    }

    // ── Seeding ─────────────────────────────────────────────────

    pub async fn insert_event(
        &self,
        name: &str,
        qr_token: &str,
        description: Option<&str>,
    ) -> Result<Event> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "INSERT INTO events (name, qr_token, description)
             VALUES ($1, $2, $3)
             RETURNING {}",
            EVENT_COLUMNS
        ))
        .bind(name)
        .bind(qr_token)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(event)
    }

    pub async fn insert_level(
        &self,
        event_id: EventId,
        level_order: i32,
        game_type: &str,
        pass_criteria: Option<&Value>,
        is_final: bool,
    ) -> Result<Level> {
        let level = sqlx::query_as::<_, Level>(&format!(
            "INSERT INTO event_levels (event_id, level_order, game_type, pass_criteria, is_final)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            LEVEL_COLUMNS
        ))
        .bind(event_id)
        .bind(level_order)
        .bind(game_type)
        .bind(pass_criteria)
        .bind(is_final)
        .fetch_one(&self.pool)
        .await?;
        Ok(level)
    }

    pub async fn insert_group_member(
        &self,
        event_id: EventId,
        group: &str,
        user_id: UserId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO event_groups (event_id, group_name) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(group)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO event_group_members (event_id, group_name, user_id) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(group)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
