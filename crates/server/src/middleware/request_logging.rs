use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Middleware that logs every request with a generated request id.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "Request received"
    );

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}
