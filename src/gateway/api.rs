//! REST query handlers for the admin dashboard.
//!
//! Read-only: every route answers from the session directory snapshot.

use super::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

use crate::error::BrokerError;

// ── Errors ──────────────────────────────────────────────────────

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::AlreadyBound(_) => StatusCode::CONFLICT,
            Self::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            Self::IdCollision(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "code": self.code(),
            })),
        )
            .into_response()
    }
}

// ── Query parameters ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SessionListQuery {
    /// Case-insensitive search over ended sessions.
    pub q: Option<String>,
}

// ── Handlers ────────────────────────────────────────────────────

/// GET /chat/sessions: every session in creation order, or `?q=` search results
pub async fn handle_list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionListQuery>,
) -> impl IntoResponse {
    let query = state.broker.query();
    let sessions = match params.q.as_deref() {
        Some(needle) => query.search(needle).await,
        None => query.list_all().await,
    };
    Json(sessions)
}

/// GET /chat/sessions/{id}: one session with its full transcript
pub async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let session = state.broker.query().get(&id).await?;
    Ok(Json(session))
}

/// GET /health: liveness plus a status breakdown
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.broker.query().counts().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": counts,
        "connections": state.broker.metrics().open_connections(),
        "pending_timers": state.broker.monitor().pending(),
    }))
}

/// GET /metrics: Prometheus text exposition
pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.broker.metrics().render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Failed to render metrics: {e}")})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_map_to_http_statuses() {
        let cases = [
            (BrokerError::NotFound("S1".into()), StatusCode::NOT_FOUND),
            (BrokerError::InvalidState("x".into()), StatusCode::CONFLICT),
            (BrokerError::AlreadyBound("S1".into()), StatusCode::CONFLICT),
            (BrokerError::MalformedFrame("x".into()), StatusCode::BAD_REQUEST),
            (
                BrokerError::IdCollision("S1".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
