//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::MatchMode;
use crate::matchmaking::MatchmakingStatus;
use crate::util::time::{uptime_secs, Tick};
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/matchmaking/status", get(matchmaking_status_handler))
        .route("/matches/:match_id", get(match_handler))
        .route("/ratings/:player_id", get(rating_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    tick_rate: u32,
    active_matches: usize,
    active_sessions: usize,
    queue_size: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_size = state.matchmaking.queue_size().await;

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        tick_rate: state.sim.tick_rate.ticks_per_second(),
        active_matches: state.registry.active_matches(),
        active_sessions: state.registry.total_sessions(),
        queue_size,
    })
}

// ============================================================================
// Matchmaking endpoints
// ============================================================================

async fn matchmaking_status_handler(State(state): State<AppState>) -> Json<MatchmakingStatus> {
    Json(state.matchmaking.status().await)
}

#[derive(Serialize)]
struct MatchResponse {
    match_id: Uuid,
    mode: MatchMode,
    tick: Tick,
    sessions: usize,
}

async fn match_handler(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchResponse>, AppError> {
    let handle = state
        .registry
        .get(&match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))?;

    Ok(Json(MatchResponse {
        match_id,
        mode: handle.mode,
        tick: handle.current_tick(),
        sessions: handle.session_count(),
    }))
}

#[derive(Serialize)]
struct RatingResponse {
    player_id: Uuid,
    rating: f64,
    current_match: Option<Uuid>,
}

async fn rating_handler(
    State(state): State<AppState>,
    Path(player_id): Path<Uuid>,
) -> Result<Json<RatingResponse>, AppError> {
    let rating = state
        .ratings
        .rating(player_id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(RatingResponse {
        player_id,
        rating,
        current_match: state.matchmaking.player_match(&player_id),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_empty_server() {
        let router = build_router(AppState::new(Config::default()));
        let (status, body) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_matches"], 0);
        assert_eq!(body["tick_rate"], 20);
    }

    #[tokio::test]
    async fn matchmaking_status_reports_mode() {
        let router = build_router(AppState::new(Config::default()));
        let (status, body) = get_json(router, "/matchmaking/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "team_deathmatch");
        assert_eq!(body["queued"], 0);
    }

    #[tokio::test]
    async fn unknown_match_is_not_found() {
        let router = build_router(AppState::new(Config::default()));
        let (status, body) = get_json(router, &format!("/matches/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().starts_with("match "));
    }

    #[tokio::test]
    async fn unseen_player_has_default_rating() {
        let router = build_router(AppState::new(Config::default()));
        let (status, body) = get_json(router, &format!("/ratings/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rating"], 1500.0);
        assert!(body["current_match"].is_null());
    }
}
