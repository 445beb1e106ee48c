//! Engine configuration.
//!
//! Parsed by clap as a flattened argument group, so every knob is available
//! both as a `--flag` and as a `UTSAV_*` environment variable (`.env` files are
//! loaded by `main` via dotenvy before parsing).

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::leaderboard::ScoreRule;
use crate::retry::RetryPolicy;

pub const DEV_JWT_SECRET: &str = "utsav-dev-secret-change-me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StandingsStrategy {
    /// Scan passed records on every leaderboard read
    OnRead,
    /// Keep a per-event cache updated on every completion
    Incremental,
}

#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// HS256 secret for bearer tokens
    #[arg(long, env = "UTSAV_JWT_SECRET", default_value = DEV_JWT_SECRET, hide_env_values = true)]
    pub jwt_secret: String,

    /// Issuer claim written into and required from bearer tokens
    #[arg(long, env = "UTSAV_JWT_ISSUER", default_value = "utsav")]
    pub jwt_issuer: String,

    /// Bearer token lifetime in minutes
    #[arg(long, env = "UTSAV_TOKEN_TTL_MINUTES", default_value_t = 24 * 60)]
    pub token_ttl_minutes: i64,

    /// OTP validity in minutes
    #[arg(long, env = "UTSAV_OTP_TTL_MINUTES", default_value_t = 5)]
    pub otp_ttl_minutes: i64,

    /// Field of `result_data` summed into a user's total score
    #[arg(long, env = "UTSAV_SCORE_FIELD", default_value = "score")]
    pub score_field: String,

    /// How leaderboard standings are maintained
    #[arg(long, env = "UTSAV_LEADERBOARD_STRATEGY", value_enum, default_value_t = StandingsStrategy::OnRead)]
    pub leaderboard_strategy: StandingsStrategy,

    /// Attempts for storage operations that hit transient errors
    #[arg(long, env = "UTSAV_STORE_RETRIES", default_value_t = 3)]
    pub store_retries: u32,

    /// Base delay between storage retries in milliseconds (grows linearly)
    #[arg(long, env = "UTSAV_RETRY_DELAY_MS", default_value_t = 50)]
    pub retry_delay_ms: u64,

    /// Fail in-progress attempts older than this many minutes (disabled when unset)
    #[arg(long, env = "UTSAV_STALE_AFTER_MINUTES")]
    pub stale_after_minutes: Option<i64>,

    /// How often the server runs the stale sweeper, in seconds
    #[arg(long, env = "UTSAV_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn score_rule(&self) -> ScoreRule {
        ScoreRule::new(self.score_field.clone())
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_ttl_minutes)
    }

    pub fn otp_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.otp_ttl_minutes)
    }

    pub fn stale_after(&self) -> Option<chrono::Duration> {
        self.stale_after_minutes
            .filter(|m| *m > 0)
            .map(chrono::Duration::minutes)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: "utsav".to_string(),
            token_ttl_minutes: 24 * 60,
            otp_ttl_minutes: 5,
            score_field: "score".to_string(),
            leaderboard_strategy: StandingsStrategy::OnRead,
            store_retries: 3,
            retry_delay_ms: 50,
            stale_after_minutes: None,
            sweep_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: EngineConfig,
    }

    #[test]
    fn clap_defaults_match_default_impl() {
        let parsed = TestCli::parse_from(["utsav"]).config;
        let default = EngineConfig::default();
        assert_eq!(parsed.jwt_issuer, default.jwt_issuer);
        assert_eq!(parsed.token_ttl_minutes, default.token_ttl_minutes);
        assert_eq!(parsed.score_field, default.score_field);
        assert_eq!(parsed.leaderboard_strategy, StandingsStrategy::OnRead);
        assert!(parsed.stale_after().is_none());
    }

    #[test]
    fn strategy_and_stale_flags_parse() {
        let parsed = TestCli::parse_from([
            "utsav",
            "--leaderboard-strategy",
            "incremental",
            "--stale-after-minutes",
            "30",
        ])
        .config;
        assert_eq!(parsed.leaderboard_strategy, StandingsStrategy::Incremental);
        assert_eq!(parsed.stale_after(), Some(chrono::Duration::minutes(30)));
    }

    #[test]
    fn non_positive_stale_age_disables_sweeper() {
        let config = EngineConfig {
            stale_after_minutes: Some(0),
            ..Default::default()
        };
        assert!(config.stale_after().is_none());
    }
}
