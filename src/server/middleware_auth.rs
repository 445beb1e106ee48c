//! Bearer-token extractors.
//!
//! Reads `Authorization: Bearer <token>`, verifies it with the identity
//! service, and resolves it to a live [`User`]. `RequireAuth` rejects with a
//! 401 JSON body; `MaybeAuth` lets anonymous callers through.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::AppState;
use crate::error::EngineError;
use crate::model::User;

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum extractor that requires a valid bearer token.
pub struct RequireAuth(pub User);

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or_else(|| {
            EngineError::Unauthorized("authentication required".into()).into_response()
        })?;
        let user = state
            .identity
            .authenticate(token)
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(RequireAuth(user))
    }
}

/// Axum extractor for routes that personalise output when a caller is known.
/// A present but invalid token is still rejected.
pub struct MaybeAuth(pub Option<User>);

impl FromRequestParts<Arc<AppState>> for MaybeAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match bearer_token(parts) {
            None => Ok(MaybeAuth(None)),
            Some(token) => state
                .identity
                .authenticate(token)
                .await
                .map(|user| MaybeAuth(Some(user)))
                .map_err(IntoResponse::into_response),
        }
    }
}
