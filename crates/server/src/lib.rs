pub mod dispatch;
pub mod handler;
pub mod middleware;
pub mod streaming;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{Router, middleware as axum_mw, routing::get};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use powerproxy_core::clock::{Clock, RandomSource};
use powerproxy_core::config::Config;
use powerproxy_core::metrics::Metrics;
use powerproxy_core::target::TargetRegistry;
use powerproxy_core::token::TokenSource;
use powerproxy_plugins::base::PluginHost;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<TargetRegistry>,
    pub plugins: Arc<PluginHost>,
    pub token_source: Arc<dyn TokenSource>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub metrics: Arc<Metrics>,
    /// API key to client name, derived once from the config.
    pub key_client_map: Arc<HashMap<String, String>>,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit_bytes = state.config.body_limit_mb * 1024 * 1024;

    // Liveness and metrics are the only routes the proxy understands itself;
    // every other GET or POST is forwarded upstream.
    Router::new()
        .route(
            "/powerproxy/health/liveness",
            get(handler::health::liveness),
        )
        .route("/metrics", get(handler::health::metrics))
        .route(
            "/",
            get(handler::proxy::handle).post(handler::proxy::handle),
        )
        .route(
            "/{*path}",
            get(handler::proxy::handle).post(handler::proxy::handle),
        )
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(axum_mw::from_fn(
            middleware::request_logging::request_logging_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
