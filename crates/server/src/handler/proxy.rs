use crate::AppState;
use crate::dispatch::dispatch;
use axum::extract::{Request, State};
use axum::response::Response;

/// Catch-all for every GET and POST the router does not handle itself.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    dispatch(&state, request).await
}
