//! Event catalog API — QR entry, the level list, and level detail.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::middleware_auth::MaybeAuth;
use super::extract::ApiPath;
use super::AppState;
use crate::error::EngineError;
use crate::model::{Event, EventId, LevelId};
use crate::tracker::LevelView;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LevelsResponse {
    event_id: EventId,
    levels: Vec<LevelView>,
}

/// GET /api/events/qr/{token} — 404 for unknown tokens, 410 for inactive events.
pub(super) async fn handler_event_by_qr(
    State(state): State<Arc<AppState>>,
    ApiPath(token): ApiPath<String>,
) -> Result<Json<Event>, EngineError> {
    state.tracker.event_by_qr(&token).await.map(Json)
}

/// GET /api/events/{id}/levels — enabled levels in order. With a bearer token
/// each level carries the caller's status; anonymous callers see only the
/// first level unlocked.
pub(super) async fn handler_event_levels(
    State(state): State<Arc<AppState>>,
    MaybeAuth(user): MaybeAuth,
    ApiPath(event_id): ApiPath<EventId>,
) -> Result<Json<LevelsResponse>, EngineError> {
    let levels = state
        .tracker
        .level_views(user.map(|u| u.user_id), event_id)
        .await?;
    Ok(Json(LevelsResponse { event_id, levels }))
}

/// GET /api/events/{id}/levels/{level_id} — one level with the caller's status.
pub(super) async fn handler_level_detail(
    State(state): State<Arc<AppState>>,
    MaybeAuth(user): MaybeAuth,
    ApiPath((event_id, level_id)): ApiPath<(EventId, LevelId)>,
) -> Result<Json<LevelView>, EngineError> {
    state
        .tracker
        .level_view(user.map(|u| u.user_id), event_id, level_id)
        .await
        .map(Json)
}
