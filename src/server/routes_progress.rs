//! Progress API — start, save, complete, and resume.
//!
//! `start` is idempotent: calling it again for an in-progress level returns the
//! same `progressId` (200 instead of 201) along with any saved game state.
//! `complete` succeeds exactly once per `progressId`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::extract::{ApiJson, ApiPath};
use super::middleware_auth::RequireAuth;
use super::AppState;
use crate::error::EngineError;
use crate::model::{EventId, LevelId, ProgressId, ProgressRecord};
use crate::tracker::{CompleteOutcome, ProgressSummary, StartOutcome};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartRequest {
    #[serde(default, alias = "device_info")]
    device_info: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CompleteRequest {
    #[serde(alias = "progress_id")]
    progress_id: ProgressId,
    #[serde(alias = "is_passed")]
    is_passed: bool,
    #[serde(default = "empty_object", alias = "result_data")]
    result_data: Value,
    #[serde(default, alias = "device_info")]
    device_info: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SaveStateRequest {
    #[serde(alias = "progress_id")]
    progress_id: ProgressId,
    #[serde(alias = "game_state")]
    game_state: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SaveStateResponse {
    progress_id: ProgressId,
    game_state: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// GET /api/events/{id}/progress — per-level status with locked levels.
pub(super) async fn handler_progress_summary(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath(event_id): ApiPath<EventId>,
) -> Result<Json<ProgressSummary>, EngineError> {
    state
        .tracker
        .progress_summary(user.user_id, event_id)
        .await
        .map(Json)
}

/// GET /api/events/{id}/progress/records — raw records, for resuming.
pub(super) async fn handler_progress_records(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath(event_id): ApiPath<EventId>,
) -> Result<Json<Vec<ProgressRecord>>, EngineError> {
    state
        .tracker
        .get_progress(user.user_id, event_id)
        .await
        .map(Json)
}

/// POST /api/events/{id}/levels/{level_id}/start — 201 for a new attempt,
/// 200 when resuming the open one.
pub(super) async fn handler_level_start(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath((event_id, level_id)): ApiPath<(EventId, LevelId)>,
    ApiJson(body): ApiJson<StartRequest>,
) -> Result<(StatusCode, Json<StartOutcome>), EngineError> {
    let started = state
        .tracker
        .start_level(user.user_id, event_id, level_id, body.device_info)
        .await?;
    let status = if started.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(started)))
}

/// PUT /api/events/{id}/levels/{level_id}/progress — save game state for resume.
pub(super) async fn handler_level_save(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath((event_id, level_id)): ApiPath<(EventId, LevelId)>,
    ApiJson(body): ApiJson<SaveStateRequest>,
) -> Result<Json<SaveStateResponse>, EngineError> {
    let record = state
        .tracker
        .save_game_state(user.user_id, event_id, level_id, body.progress_id, body.game_state)
        .await?;
    Ok(Json(SaveStateResponse {
        progress_id: record.progress_id,
        game_state: record.game_state,
    }))
}

/// GET /api/events/{id}/levels/{level_id}/attempts
pub(super) async fn handler_level_attempts(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath((event_id, level_id)): ApiPath<(EventId, LevelId)>,
) -> Result<Json<Vec<ProgressRecord>>, EngineError> {
    state
        .tracker
        .level_attempts(user.user_id, event_id, level_id)
        .await
        .map(Json)
}

/// POST /api/events/{id}/levels/{level_id}/complete
pub(super) async fn handler_level_complete(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiPath((event_id, level_id)): ApiPath<(EventId, LevelId)>,
    ApiJson(body): ApiJson<CompleteRequest>,
) -> Result<Json<CompleteOutcome>, EngineError> {
    state
        .tracker
        .complete_level(
            user.user_id,
            event_id,
            level_id,
            body.progress_id,
            body.result_data,
            body.is_passed,
            body.device_info,
        )
        .await
        .map(Json)
}
