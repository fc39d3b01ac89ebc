use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Liveness probe; some hosting services require it to decide whether the
/// container is healthy.
pub async fn liveness() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
