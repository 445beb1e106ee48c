//! # Server — HTTP API for Login, Progress, and Leaderboards
//!
//! Runs an Axum HTTP server over the engine. Route handlers are thin: they
//! authenticate, parse, call into [`ProgressTracker`], [`LeaderboardAggregator`]
//! or [`IdentityService`], and serialize. Engine errors become JSON bodies of
//! the form `{"error", "code", "retryable"}` with a matching status.
//!
//! When `stale_after_minutes` is configured, a background task periodically
//! fails abandoned attempts.

mod extract;
pub(crate) mod middleware_auth;
mod routes_auth;
mod routes_events;
mod routes_health;
mod routes_leaderboard;
mod routes_progress;

use crate::auth::{IdentityService, JwtService, LogOtpSender, OtpSender};
use crate::config::{EngineConfig, StandingsStrategy};
use crate::error::EngineError;
use crate::leaderboard::{ComputeOnRead, IncrementalStandings, LeaderboardAggregator, Standings};
use crate::prom_metrics;
use crate::store::ProgressStore;
use crate::tracker::ProgressTracker;
use anyhow::Result;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn, Instrument};

pub struct AppState {
    pub store: Arc<dyn ProgressStore>,
    pub identity: IdentityService,
    pub tracker: ProgressTracker,
    pub leaderboard: Arc<LeaderboardAggregator>,
    pub config: EngineConfig,
    pub prom_metrics: Arc<prom_metrics::Metrics>,
}

impl AppState {
    pub fn build(store: Arc<dyn ProgressStore>, config: EngineConfig) -> Arc<Self> {
        Self::build_with_sender(store, config, Arc::new(LogOtpSender))
    }

    /// Wire the engine over `store`. The OTP sender is injectable so tests can
    /// capture codes.
    pub fn build_with_sender(
        store: Arc<dyn ProgressStore>,
        config: EngineConfig,
        sender: Arc<dyn OtpSender>,
    ) -> Arc<Self> {
        let prom_metrics = Arc::new(prom_metrics::Metrics::new());
        let retry = config
            .retry_policy()
            .with_counter(prom_metrics.store_retries.clone());

        let standings: Arc<dyn Standings> = match config.leaderboard_strategy {
            StandingsStrategy::OnRead => {
                Arc::new(ComputeOnRead::new(store.clone(), config.score_rule()))
            }
            StandingsStrategy::Incremental => {
                Arc::new(IncrementalStandings::new(store.clone(), config.score_rule()))
            }
        };
        let leaderboard = Arc::new(LeaderboardAggregator::new(
            store.clone(),
            standings,
            retry.clone(),
        ));
        let tracker = ProgressTracker::new(
            store.clone(),
            leaderboard.clone(),
            retry.clone(),
            prom_metrics.clone(),
        );
        let jwt = JwtService::new(
            &config.jwt_secret,
            config.jwt_issuer.clone(),
            config.token_ttl(),
        );
        let identity = IdentityService::new(store.clone(), jwt, sender, retry, config.otp_ttl());

        Arc::new(AppState {
            store,
            identity,
            tracker,
            leaderboard,
            config,
            prom_metrics,
        })
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            EngineError::Internal(e) => error!(error = ?e, "internal error"),
            EngineError::Unavailable(msg) => warn!(error = %msg, "storage unavailable"),
            other => debug!(code = other.code(), error = %other, "request rejected"),
        }
        let message = match &self {
            EngineError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (
            status,
            Json(serde_json::json!({
                "error": message,
                "code": self.code(),
                "retryable": self.is_retryable(),
            })),
        )
            .into_response()
    }
}

/// Records request duration into the Prometheus histogram, generates (or
/// propagates) `x-request-id`, and instruments the request with a span.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse numeric ids, UUIDs and QR tokens into placeholders so histogram
/// labels stay bounded.
fn normalize_path(path: &str) -> String {
    let mut prev = "";
    path.split('/')
        .map(|seg| {
            let out = if seg.is_empty() {
                seg.to_string()
            } else if prev == "qr" {
                ":token".to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else {
                seg.to_string()
            };
            prev = seg;
            out
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/send-otp", post(routes_auth::handler_send_otp))
        .route("/api/auth/verify-otp", post(routes_auth::handler_verify_otp))
        .route(
            "/api/auth/me",
            get(routes_auth::handler_me_get).put(routes_auth::handler_me_update),
        )
        .route(
            "/api/events/qr/{token}",
            get(routes_events::handler_event_by_qr),
        )
        .route(
            "/api/events/{id}/levels",
            get(routes_events::handler_event_levels),
        )
        .route(
            "/api/events/{id}/levels/{level_id}",
            get(routes_events::handler_level_detail),
        )
        .route(
            "/api/events/{id}/progress",
            get(routes_progress::handler_progress_summary),
        )
        .route(
            "/api/events/{id}/progress/records",
            get(routes_progress::handler_progress_records),
        )
        .route(
            "/api/events/{id}/levels/{level_id}/start",
            post(routes_progress::handler_level_start),
        )
        .route(
            "/api/events/{id}/levels/{level_id}/progress",
            put(routes_progress::handler_level_save),
        )
        .route(
            "/api/events/{id}/levels/{level_id}/complete",
            post(routes_progress::handler_level_complete),
        )
        .route(
            "/api/events/{id}/levels/{level_id}/attempts",
            get(routes_progress::handler_level_attempts),
        )
        .route(
            "/api/events/{id}/leaderboard",
            get(routes_leaderboard::handler_leaderboard),
        )
        .route(
            "/api/events/{id}/leaderboard/me",
            get(routes_leaderboard::handler_leaderboard_me),
        )
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(256 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Spawn the periodic stale-attempt sweeper if an age limit is configured.
fn spawn_sweeper(state: &Arc<AppState>) {
    let Some(max_age) = state.config.stale_after() else {
        return;
    };
    let sweep_state = Arc::clone(state);
    let period = Duration::from_secs(state.config.sweep_interval_secs.max(1));
    info!(
        max_age_minutes = max_age.num_minutes(),
        interval_secs = period.as_secs(),
        "stale attempt sweeper enabled"
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_state.tracker.expire_stale_attempts(max_age).await {
                warn!(error = %e, "stale sweep failed");
            }
        }
    });
}

pub async fn run(port: u16, store: Arc<dyn ProgressStore>, config: EngineConfig) -> Result<()> {
    if config.uses_dev_secret() {
        warn!("UTSAV_JWT_SECRET is not set, using the development secret");
    }
    let state = AppState::build(store, config);
    spawn_sweeper(&state);
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
