//! Auth API — OTP login and the caller's own profile.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::middleware_auth::RequireAuth;
use super::extract::ApiJson;
use super::AppState;
use crate::auth::{OtpIssued, Session};
use crate::error::EngineError;
use crate::model::User;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SendOtpRequest {
    #[serde(alias = "phone_number")]
    phone_number: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VerifyOtpRequest {
    #[serde(alias = "phone_number")]
    phone_number: String,
    #[serde(alias = "otp")]
    code: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateMeRequest {
    #[serde(alias = "display_name", alias = "name")]
    display_name: String,
}

/// POST /api/auth/send-otp
pub(super) async fn handler_send_otp(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<SendOtpRequest>,
) -> Result<Json<OtpIssued>, EngineError> {
    state.identity.send_otp(&body.phone_number).await.map(Json)
}

/// POST /api/auth/verify-otp — signs in, creating the account on first login.
pub(super) async fn handler_verify_otp(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<VerifyOtpRequest>,
) -> Result<Json<Session>, EngineError> {
    state
        .identity
        .verify_otp(&body.phone_number, &body.code, body.name.as_deref())
        .await
        .map(Json)
}

/// GET /api/auth/me
pub(super) async fn handler_me_get(RequireAuth(user): RequireAuth) -> Json<User> {
    Json(user)
}

/// PUT /api/auth/me — only the display name is mutable.
pub(super) async fn handler_me_update(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiJson(body): ApiJson<UpdateMeRequest>,
) -> Result<Json<User>, EngineError> {
    state
        .identity
        .update_display_name(user.user_id, &body.display_name)
        .await
        .map(Json)
}
