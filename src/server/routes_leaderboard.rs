//! Leaderboard API.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::middleware_auth::RequireAuth;
use super::extract::{ApiPath, ApiQuery};
use super::AppState;
use crate::error::EngineError;
use crate::leaderboard::{Leaderboard, LeaderboardFilter, MyRank};
use crate::model::EventId;

#[derive(Deserialize, Default)]
pub(super) struct LeaderboardQuery {
    filter: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// GET /api/events/{id}/leaderboard?filter=all|completed|group:<name>&limit&offset
pub(super) async fn handler_leaderboard(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath(event_id): ApiPath<EventId>,
    ApiQuery(params): ApiQuery<LeaderboardQuery>,
) -> Result<Json<Leaderboard>, EngineError> {
    let filter: LeaderboardFilter = params.filter.as_deref().unwrap_or("all").parse()?;
    state
        .leaderboard
        .get_leaderboard(
            event_id,
            &filter,
            params.limit,
            params.offset,
            Some(user.user_id),
        )
        .await
        .map(Json)
}

/// GET /api/events/{id}/leaderboard/me
pub(super) async fn handler_leaderboard_me(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath(event_id): ApiPath<EventId>,
) -> Result<Json<MyRank>, EngineError> {
    state
        .leaderboard
        .get_my_rank(event_id, user.user_id)
        .await
        .map(Json)
}
