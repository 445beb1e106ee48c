//! User lookup and creation.

use super::Database;
use crate::model::{User, UserId};
use anyhow::Result;

const USER_COLUMNS: &str = "user_id, phone_number, display_name, created_at, updated_at";

impl Database {
    pub(super) async fn user_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE user_id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub(super) async fn users_by_ids(&self, user_ids: &[UserId]) -> Result<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE user_id = ANY($1)",
            USER_COLUMNS
        ))
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    pub(super) async fn user_by_phone(&self, phone_number: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE phone_number = $1",
            USER_COLUMNS
        ))
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Insert, or return the row a concurrent verification created first.
    pub async fn insert_user(&self, phone_number: &str, display_name: &str) -> Result<User> {
        let inserted = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (user_id, phone_number, display_name)
             VALUES ($1, $2, $3)
             ON CONFLICT (phone_number) DO NOTHING
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(uuid::Uuid::new_v4())
        .bind(phone_number)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(user) => Ok(user),
            None => self
                .user_by_phone(phone_number)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished after conflict", phone_number)),
        }
    }

    pub(super) async fn set_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET display_name = $2, updated_at = NOW()
             WHERE user_id = $1
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}
