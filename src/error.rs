//! Engine error taxonomy.
//!
//! Every precondition the tracker, leaderboard, or identity provider checks
//! has its own variant so callers can tell a safe retry (`Unavailable`) from
//! one that will always fail (`AlreadyCompleted`, `SequenceViolation`).
//! Storage failures never surface as domain variants: transient ones become
//! `Unavailable` after bounded retries, everything else is `Internal`.

use axum::http::StatusCode;
use thiserror::Error;

use crate::model::{LevelId, ProgressId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("level {level_id} is locked until level {previous_level_id} is passed")]
    SequenceViolation {
        level_id: LevelId,
        previous_level_id: LevelId,
    },

    #[error("level {level_id} was already completed (progress {progress_id})")]
    AlreadyCompleted {
        level_id: LevelId,
        progress_id: ProgressId,
    },

    #[error("progress {0} is unknown or no longer in progress")]
    InvalidProgressId(ProgressId),

    #[error("progress {0} belongs to another user")]
    Forbidden(ProgressId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown leaderboard filter: {0}")]
    InvalidFilter(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} is no longer active")]
    Gone(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::SequenceViolation { .. } => "sequence_violation",
            EngineError::AlreadyCompleted { .. } => "already_completed",
            EngineError::InvalidProgressId(_) => "invalid_progress_id",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::InvalidFilter(_) => "invalid_filter",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Gone(_) => "gone",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SequenceViolation { .. } => StatusCode::CONFLICT,
            EngineError::AlreadyCompleted { .. } => StatusCode::CONFLICT,
            EngineError::InvalidProgressId(_) => StatusCode::CONFLICT,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Gone(_) => StatusCode::GONE,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when repeating the identical request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }
}
