//! OTP challenges.
//!
//! Issuing a challenge closes every earlier open one for the phone in the same
//! transaction. Consumption locks the matching row with `FOR UPDATE SKIP
//! LOCKED`, so two concurrent verifications of the same code cannot both win.

use super::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};

impl Database {
    pub(super) async fn insert_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE otp_challenges SET consumed = TRUE
             WHERE phone_number = $1 AND NOT consumed",
        )
        .bind(phone_number)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO otp_challenges (phone_number, code_hash, expires_at)
             VALUES ($1, $2, $3)",
        )
        .bind(phone_number)
        .bind(code_hash)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn claim_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE otp_challenges SET consumed = TRUE
             WHERE id = (
               SELECT id FROM otp_challenges
               WHERE phone_number = $1 AND code_hash = $2
                 AND NOT consumed AND expires_at > $3
               ORDER BY created_at DESC
               LIMIT 1
               FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(phone_number)
        .bind(code_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    /// Delete challenges that expired before `cutoff`.
    pub async fn purge_expired_otps(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM otp_challenges WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
