//! End-to-end dispatch tests against in-process mock upstreams.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::any;
use tower::ServiceExt;

use powerproxy_core::clock::{Clock, SystemClock, ThreadRngSource};
use powerproxy_core::config::Config;
use powerproxy_core::metrics::Metrics;
use powerproxy_core::slip::RoutingSlip;
use powerproxy_core::target::TargetRegistry;
use powerproxy_core::token::{StaticTokenSource, TokenSource};
use powerproxy_plugins::base::{HookResult, PluginHost, ProxyPlugin};
use powerproxy_plugins::token_count::TokenCounter;
use powerproxy_server::{AppState, build_router};

// ─── Harness ───────────────────────────────────────────────────────────────

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn state_from_yaml(config_yaml: &str) -> AppState {
    let config: Config = serde_yaml_ng::from_str(config_yaml).unwrap();
    let config = Arc::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let token_source: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new("upstream-token"));
    let plugins = powerproxy_plugins::build_host(config.clone(), clock.clone(), token_source.clone())
        .await
        .unwrap();
    state_with_host(config, plugins, token_source)
}

fn state_with_host(
    config: Arc<Config>,
    plugins: PluginHost,
    token_source: Arc<dyn TokenSource>,
) -> AppState {
    let registry = Arc::new(TargetRegistry::from_config(&config).unwrap());
    let key_client_map = Arc::new(config.key_client_map());
    AppState {
        config,
        registry,
        plugins: Arc::new(plugins),
        token_source,
        clock: Arc::new(SystemClock),
        random: Arc::new(ThreadRngSource),
        metrics: Arc::new(Metrics::new()),
        key_client_map,
    }
}

async fn send(
    router: &Router,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut request = Request::builder().method("POST").uri(path);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn json(body: &Bytes) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

// ─── Scenario: allow-list deny ─────────────────────────────────────────────

#[tokio::test]
async fn allow_list_deny_blocks_before_any_upstream_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let upstream_calls = calls.clone();
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(move || {
        let calls = upstream_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            axum::Json(serde_json::json!({"choices": []}))
        }
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
      key: "real-key"
clients:
  - name: A
    api_keys: ["key-a"]
    deployments_allowed: [x]
plugins:
  - name: AllowDeployments
"#
    ))
    .await;
    let router = build_router(state);

    let (status, _, body) = send(
        &router,
        "/openai/deployments/y/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let message = json(&body)["error"].as_str().unwrap().to_string();
    assert!(message.starts_with("Access to requested deployment 'y' is denied."));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ─── Scenario: rate-limit block ────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_blocks_after_budget_spent() {
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(|| async {
        axum::Json(serde_json::json!({
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"prompt_tokens": 500, "completion_tokens": 25, "total_tokens": 525}
        }))
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
      key: "real-key"
      virtual_deployments:
        - name: d
          standins:
            - name: d
clients:
  - name: B
    api_keys: ["key-b"]
    max_tokens_per_minute_in_k: 1
plugins:
  - name: LimitUsage
"#
    ))
    .await;
    let router = build_router(state);

    let path = "/openai/deployments/d/chat/completions";
    let headers = [("api-key", "key-b")];

    // Two requests spend 1050 of the 1000-token budget.
    let (status, _, _) = send(&router, path, &headers, "{}").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&router, path, &headers, "{}").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&router, path, &headers, "{}").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json(&body)["message"],
        "Too many requests for client 'B' / virtual deployment 'd'. Try again later."
    );
}

// ─── Scenario: target failover ─────────────────────────────────────────────

#[tokio::test]
async fn failover_cools_down_saturated_target() {
    let e1_calls = Arc::new(AtomicUsize::new(0));
    let counter = e1_calls.clone();
    let e1 = spawn_upstream(Router::new().route("/{*path}", any(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after-ms", "2000")],
                axum::Json(serde_json::json!({"error": "throttled"})),
            )
        }
    })))
    .await;
    let e2 = spawn_upstream(Router::new().route("/{*path}", any(|| async {
        axum::Json(serde_json::json!({"choices": [{"message": {"content": "from e2"}}]}))
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: e1
      url: "{e1}"
      key: "k1"
    - name: e2
      url: "{e2}"
      key: "k2"
clients:
  - name: A
    api_keys: ["key-a"]
"#
    ))
    .await;
    let registry = state.registry.clone();
    let clock = state.clock.clone();
    let router = build_router(state);

    let before_ms = clock.now_ms();
    let (status, _, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["choices"][0]["message"]["content"], "from e2");
    assert_eq!(e1_calls.load(Ordering::SeqCst), 1);

    // e1 went into a ~2s cooldown as instructed by its retry-after-ms.
    let cooldown = registry.targets[0].cooldown_until_ms();
    assert!(cooldown >= before_ms + 2_000);
    assert!(cooldown <= clock.now_ms() + 2_000);

    // A follow-up request within the cooldown window skips e1 entirely.
    let (status, _, _) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(e1_calls.load(Ordering::SeqCst), 1);
}

// ─── Scenario: streaming passthrough ───────────────────────────────────────

struct StreamRecorder {
    data_events: Arc<AtomicUsize>,
    stream_ends: Arc<AtomicUsize>,
}

#[async_trait]
impl ProxyPlugin for StreamRecorder {
    fn name(&self) -> &'static str {
        "StreamRecorder"
    }

    fn requires_token_counts(&self) -> bool {
        true
    }

    async fn on_data_event_from_target_received(&self, _slip: &RoutingSlip) -> HookResult {
        self.data_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_end_of_target_response_stream_reached(&self, _slip: &RoutingSlip) -> HookResult {
        self.stream_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn streaming_passthrough_preserves_lines_and_fires_hooks() {
    const UPSTREAM_BODY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\
                                 \n\
                                 data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\
                                 data: [DONE]\n";
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(|| async {
        Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from(UPSTREAM_BODY))
            .unwrap()
    })))
    .await;

    let config: Config = serde_yaml_ng::from_str(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
      key: "real-key"
clients:
  - name: A
    api_keys: ["key-a"]
"#
    ))
    .unwrap();

    let data_events = Arc::new(AtomicUsize::new(0));
    let stream_ends = Arc::new(AtomicUsize::new(0));
    let host = PluginHost::new(
        vec![Arc::new(StreamRecorder {
            data_events: data_events.clone(),
            stream_ends: stream_ends.clone(),
        })],
        Some(TokenCounter::new().unwrap()),
    );
    let token_source: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new("t"));
    let router = build_router(state_with_host(Arc::new(config), host, token_source));

    let (status, headers, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        r#"{"stream": true}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/event-stream")
    );
    assert_eq!(
        String::from_utf8(body.to_vec()).unwrap(),
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\
         \r\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\r\n\
         data: [DONE]\r\n"
    );

    // Two data events (none for [DONE]) and one terminal hook.
    for _ in 0..50 {
        if stream_ends.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(data_events.load(Ordering::SeqCst), 2);
    assert_eq!(stream_ends.load(Ordering::SeqCst), 1);
}

// ─── Scenario: Entra-only request ──────────────────────────────────────────

struct ClientCapture {
    client: Arc<std::sync::Mutex<Option<String>>>,
}

#[async_trait]
impl ProxyPlugin for ClientCapture {
    fn name(&self) -> &'static str {
        "ClientCapture"
    }

    async fn on_client_identified(&self, slip: &RoutingSlip) -> HookResult {
        *self.client.lock().unwrap() = slip.client.clone();
        Ok(())
    }
}

#[tokio::test]
async fn entra_request_passes_authorization_through() {
    let seen_auth = Arc::new(std::sync::Mutex::new(None::<String>));
    let seen = seen_auth.clone();
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(move |request: Request<Body>| {
        let seen = seen.clone();
        async move {
            *seen.lock().unwrap() = request
                .headers()
                .get("authorization")
                .map(|v| v.to_str().unwrap().to_string());
            assert!(request.headers().get("api-key").is_none());
            axum::Json(serde_json::json!({"choices": []}))
        }
    })))
    .await;

    let config: Config = serde_yaml_ng::from_str(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
clients:
  - name: EntraTeam
    uses_entra_id_auth: true
"#
    ))
    .unwrap();

    let identified = Arc::new(std::sync::Mutex::new(None));
    let host = PluginHost::new(
        vec![Arc::new(ClientCapture {
            client: identified.clone(),
        })],
        None,
    );
    let token_source: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new("proxy-token"));
    let router = build_router(state_with_host(Arc::new(config), host, token_source));

    let (status, _, _) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("authorization", "Bearer opaque-client-token")],
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(identified.lock().unwrap().as_deref(), Some("EntraTeam"));
    // The caller's bearer token is forwarded unchanged, without any token
    // acquisition by the proxy.
    assert_eq!(
        seen_auth.lock().unwrap().as_deref(),
        Some("Bearer opaque-client-token")
    );
}

// ─── Scenario: all targets cooling ─────────────────────────────────────────

#[tokio::test]
async fn exhausted_registry_returns_429_with_retry_after() {
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(|| async {
        axum::Json(serde_json::json!({"choices": []}))
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: e1
      url: "{upstream}"
      key: "k1"
    - name: e2
      url: "{upstream}"
      key: "k2"
clients:
  - name: A
    api_keys: ["key-a"]
"#
    ))
    .await;
    for target in &state.registry.targets {
        target.set_cooldown_until(u64::MAX);
    }
    let router = build_router(state);

    let (status, headers, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get("retry-after-ms").unwrap(), "10000");
    assert_eq!(
        json(&body)["message"],
        "Could not find any endpoint or deployment with remaining capacity. Try again later."
    );
}

// ─── Identification and validation edges ───────────────────────────────────

#[tokio::test]
async fn unknown_api_key_is_rejected() {
    let state = state_from_yaml(
        r#"
aoai:
  endpoints:
    - name: e1
      url: "http://127.0.0.1:9"
clients:
  - name: A
    api_keys: ["key-a"]
"#,
    )
    .await;
    let router = build_router(state);

    let (status, _, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "wrong")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(
        json(&body)["error"]
            .as_str()
            .unwrap()
            .contains("not a valid PowerProxy key")
    );
}

#[tokio::test]
async fn bearer_without_entra_client_is_rejected() {
    let state = state_from_yaml(
        r#"
aoai:
  endpoints:
    - name: e1
      url: "http://127.0.0.1:9"
clients:
  - name: A
    api_keys: ["key-a"]
"#,
    )
    .await;
    let router = build_router(state);

    let (status, _, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("authorization", "Bearer token")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json(&body)["error"]
            .as_str()
            .unwrap()
            .contains("uses_entra_id_auth")
    );
}

#[tokio::test]
async fn unknown_virtual_deployment_is_rejected() {
    let state = state_from_yaml(
        r#"
aoai:
  endpoints:
    - name: e1
      url: "http://127.0.0.1:9"
      virtual_deployments:
        - name: gpt
          standins:
            - name: gpt-east
clients:
  - name: A
    api_keys: ["key-a"]
"#,
    )
    .await;
    let router = build_router(state);

    let (status, _, body) = send(
        &router,
        "/openai/deployments/other/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json(&body)["error"]
            .as_str()
            .unwrap()
            .contains("The specified deployment 'other' is not available")
    );
}

// ─── Standin path rewriting and key injection ──────────────────────────────

#[tokio::test]
async fn standin_target_rewrites_path_and_api_key() {
    let seen = Arc::new(std::sync::Mutex::new((String::new(), String::new())));
    let capture = seen.clone();
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(move |request: Request<Body>| {
        let capture = capture.clone();
        async move {
            let path = request.uri().path().to_string();
            let key = request
                .headers()
                .get("api-key")
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            *capture.lock().unwrap() = (path, key);
            axum::Json(serde_json::json!({"choices": []}))
        }
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
      key: "endpoint-key"
      virtual_deployments:
        - name: gpt
          standins:
            - name: gpt-4o-eastus
clients:
  - name: A
    api_keys: ["key-a"]
"#
    ))
    .await;
    let router = build_router(state);

    let (status, _, _) = send(
        &router,
        "/openai/deployments/gpt/chat/completions?api-version=2024-02-01",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let (path, key) = seen.lock().unwrap().clone();
    assert_eq!(path, "/openai/deployments/gpt-4o-eastus/chat/completions");
    assert_eq!(key, "endpoint-key");
}

#[tokio::test]
async fn keyless_endpoint_gets_bearer_from_token_source() {
    let seen = Arc::new(std::sync::Mutex::new(None::<String>));
    let capture = seen.clone();
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(move |request: Request<Body>| {
        let capture = capture.clone();
        async move {
            assert!(request.headers().get("api-key").is_none());
            *capture.lock().unwrap() = request
                .headers()
                .get("authorization")
                .map(|v| v.to_str().unwrap().to_string());
            axum::Json(serde_json::json!({"choices": []}))
        }
    })))
    .await;

    let state = state_from_yaml(&format!(
        r#"
aoai:
  endpoints:
    - name: primary
      url: "{upstream}"
clients:
  - name: A
    api_keys: ["key-a"]
"#
    ))
    .await;
    let router = build_router(state);

    let (status, _, _) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        seen.lock().unwrap().as_deref(),
        Some("Bearer upstream-token")
    );
}

// ─── Mock mode & health surfaces ───────────────────────────────────────────

#[tokio::test]
async fn mock_mode_answers_without_upstreams() {
    let state = state_from_yaml(
        r#"
aoai:
  mock_response:
    json: {"choices": [{"message": {"content": "mocked"}}]}
    ms_to_wait_before_return: 5
clients:
  - name: A
    api_keys: ["key-a"]
"#,
    )
    .await;
    let router = build_router(state);

    let (status, _, body) = send(
        &router,
        "/openai/deployments/gpt/chat/completions",
        &[("api-key", "key-a")],
        "{}",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["choices"][0]["message"]["content"], "mocked");
}

#[tokio::test]
async fn liveness_and_metrics_surfaces() {
    let state = state_from_yaml("aoai:\n  endpoints:\n    - name: e\n      url: \"http://127.0.0.1:9\"\n").await;
    let router = build_router(state);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/powerproxy/health/liveness")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(
        String::from_utf8(body.to_vec())
            .unwrap()
            .contains("powerproxy_requests_total")
    );
}

// ─── Header passthrough law ────────────────────────────────────────────────

#[tokio::test]
async fn anonymous_request_forwards_no_credentials() {
    let seen = Arc::new(std::sync::Mutex::new((false, false)));
    let capture = seen.clone();
    let upstream = spawn_upstream(Router::new().route("/{*path}", any(move |request: Request<Body>| {
        let capture = capture.clone();
        async move {
            *capture.lock().unwrap() = (
                request.headers().contains_key("api-key"),
                request.headers().contains_key("authorization"),
            );
            axum::Json(serde_json::json!({"choices": []}))
        }
    })))
    .await;

    let state = state_from_yaml(&format!(
        "aoai:\n  endpoints:\n    - name: e\n      url: \"{upstream}\"\n"
    ))
    .await;
    let router = build_router(state);

    // No api-key and no authorization on input: both stay absent upstream.
    let (status, _, _) = send(&router, "/openai/deployments/gpt/chat/completions", &[], "{}").await;
    assert_eq!(status, StatusCode::OK);
    let (api_key, authorization) = *seen.lock().unwrap();
    assert!(!api_key);
    assert!(!authorization);
}
