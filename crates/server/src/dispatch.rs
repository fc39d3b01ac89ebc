use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Response as HttpResponse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use powerproxy_core::clock::RandomSource;
use powerproxy_core::error::{DEFAULT_RETRY_AFTER_MS, ProxyError};
use powerproxy_core::slip::{RoutingSlip, SelectedUpstream};
use powerproxy_core::target::{Target, TargetResponse};
use powerproxy_plugins::base::Hook;

use crate::AppState;
use crate::streaming::forward_stream;

/// The per-request pipeline: identify the caller, resolve the virtual
/// deployment, select a healthy target, and forward the request as a
/// buffered or streamed response while firing the plugin hooks.
pub async fn dispatch(state: &AppState, request: Request) -> Response {
    state.metrics.record_request();
    let request_received_utc = Utc::now();
    let request_start_ms = state.clock.now_ms();

    let (parts, body) = request.into_parts();
    // Body size is capped by the RequestBodyLimitLayer on the router.
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            state.metrics.record_error();
            return ProxyError::BadRequest(format!("failed to read request body: {e}"))
                .into_response();
        }
    };

    let slip = RoutingSlip::new(
        parts.method,
        parts.uri.path().trim_start_matches('/').to_string(),
        parts.uri.query().unwrap_or_default().to_string(),
        parts.headers,
        body,
        &state.config.opensource_deployments,
        request_received_utc,
        request_start_ms,
    );

    match run_pipeline(state, slip).await {
        Ok(response) => response,
        Err(response) => {
            state.metrics.record_error();
            response
        }
    }
}

async fn run_pipeline(state: &AppState, mut slip: RoutingSlip) -> Result<Response, Response> {
    fire(state, Hook::NewRequestReceived, &slip).await?;

    slip.client = identify_client(state, &slip.headers).map_err(IntoResponse::into_response)?;
    if slip.client.is_some() {
        fire(state, Hook::ClientIdentified, &slip).await?;
    }

    // If virtual deployments are configured, the requested one must exist.
    if !state
        .registry
        .knows_virtual_deployment(slip.virtual_deployment.as_deref())
    {
        return Err(ProxyError::BadRequest(format!(
            "The specified deployment '{}' is not available. Ensure that you send the request \
             to an existing virtual deployment configured in PowerProxy.",
            slip.virtual_deployment.as_deref().unwrap_or("none")
        ))
        .into_response());
    }

    let upstream_response = select_and_send(state, &mut slip).await?;

    slip.headers_from_target = Some(upstream_response.headers.clone());
    fire(state, Hook::HeadersFromTargetReceived, &slip).await?;

    slip.is_event_stream = upstream_response
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    let status = upstream_response.status;
    let downstream_headers = downstream_headers(&upstream_response.headers);
    slip.response_headers_from_target = Some(downstream_headers.clone());

    if !slip.is_event_stream {
        return buffered_response(state, slip, upstream_response, status, downstream_headers)
            .await;
    }

    let body = forward_stream(
        state.plugins.clone(),
        state.clock.clone(),
        state.metrics.clone(),
        slip,
        upstream_response.byte_stream(),
    );
    Ok(build_response(status, downstream_headers, body))
}

/// Iterate the target registry in declaration order, applying the cooldown,
/// deployment, and streaming-fraction gates, and return the first acceptable
/// upstream response.
async fn select_and_send(
    state: &AppState,
    slip: &mut RoutingSlip,
) -> Result<TargetResponse, Response> {
    for target in &state.registry.targets {
        if target.in_cooldown(state.clock.now_ms()) {
            continue;
        }
        if !target.serves_virtual_deployment(slip.virtual_deployment.as_deref()) {
            continue;
        }
        if !passes_non_streaming_gate(
            slip.non_streaming_requested,
            target.non_streaming_fraction,
            state.random.as_ref(),
        ) {
            continue;
        }

        let headers = rewrite_headers(state, &slip.headers, target).await?;
        if let Some(standin) = target.standin_name() {
            slip.rewrite_path_for_standin(standin);
        }

        slip.upstream = Some(SelectedUpstream {
            endpoint: target.endpoint.name.clone(),
            virtual_deployment: target.virtual_deployment_name().map(str::to_string),
            standin: target.standin_name().map(str::to_string),
        });
        slip.request_start_ms = state.clock.now_ms();

        let response = match target
            .endpoint
            .send(
                slip.method.clone(),
                &slip.path,
                &slip.raw_query,
                headers,
                slip.body.clone(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::warn!("Upstream send to target '{}' timed out: {e}", target.name);
                target.set_cooldown_until(state.clock.now_ms() + DEFAULT_RETRY_AFTER_MS);
                continue;
            }
            Err(e) => {
                tracing::warn!("Upstream send to target '{}' failed: {e}", target.name);
                continue;
            }
        };

        match response.status.as_u16() {
            // The upstream's own auth decision (401) is authoritative and
            // forwarded like a success.
            200 | 401 => return Ok(response),
            408 | 429 | 500 => {
                let wait_ms = response.retry_after_ms().unwrap_or(DEFAULT_RETRY_AFTER_MS);
                target.set_cooldown_until(state.clock.now_ms() + wait_ms);
                continue;
            }
            other => {
                tracing::warn!(
                    "Unexpected HTTP code {other} while using target '{}'. Path: {} Target url: {}",
                    target.name,
                    slip.path,
                    target.endpoint.url,
                );
                continue;
            }
        }
    }

    Err(ProxyError::NoCapacity.into_response())
}

async fn buffered_response(
    state: &AppState,
    mut slip: RoutingSlip,
    upstream_response: TargetResponse,
    status: axum::http::StatusCode,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let body = upstream_response
        .bytes()
        .await
        .map_err(IntoResponse::into_response)?;

    slip.measure_roundtrip(state.clock.now_ms());
    slip.time_to_response_ms = slip.roundtrip_time_ms;
    if let Some(ms) = slip.roundtrip_time_ms {
        state.metrics.record_latency_ms(ms);
    }

    // A body that fails to parse as a JSON object is forwarded verbatim
    // without firing the body hook.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body)
        && value.is_object()
    {
        slip.body_dict_from_target = Some(value);
        state.plugins.apply_body_token_counts(&mut slip);
        fire(state, Hook::BodyDictFromTargetAvailable, &slip).await?;
        if state.plugins.requires_token_counts() {
            state
                .metrics
                .record_tokens(slip.usage.prompt_tokens, slip.usage.completion_tokens);
            fire(state, Hook::TokenCountsForRequestAvailable, &slip).await?;
        }
    }

    Ok(build_response(status, headers, Body::from(body)))
}

async fn fire(state: &AppState, hook: Hook, slip: &RoutingSlip) -> Result<(), Response> {
    state
        .plugins
        .fire(hook, slip)
        .await
        .map_err(IntoResponse::into_response)
}

/// Map incoming credentials to a configured client name.
fn identify_client(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, ProxyError> {
    if let Some(api_key) = headers.get("api-key").and_then(|v| v.to_str().ok()) {
        return match state.key_client_map.get(api_key) {
            Some(client) => Ok(Some(client.clone())),
            None => Err(ProxyError::Auth(
                "The provided API key is not a valid PowerProxy key. Ensure that the 'api-key' \
                 header contains a valid API key from the PowerProxy's configuration."
                    .to_string(),
            )),
        };
    }
    if headers.contains_key("authorization") {
        // Bearer tokens cannot be interpreted here; the request maps to the
        // single client configured for Entra ID authentication.
        return match state.config.entra_id_client() {
            Some(client) => Ok(Some(client.name.clone())),
            None => Err(ProxyError::BadRequest(
                "When Entra ID/Azure AD is used to authenticate, PowerProxy needs a client in \
                 its configuration configured with 'uses_entra_id_auth: true', so PowerProxy \
                 can map the request to a client."
                    .to_string(),
            )),
        };
    }
    Ok(None)
}

/// Rewrite auth headers for the selected target. A request that presented a
/// (verified) proxy API key gets the endpoint's real key, or a bearer token
/// when the endpoint has none; a bearer-only request passes through as-is.
async fn rewrite_headers(
    state: &AppState,
    incoming: &HeaderMap,
    target: &Target,
) -> Result<HeaderMap, Response> {
    let mut headers = incoming.clone();
    if !headers.contains_key("api-key") {
        return Ok(headers);
    }

    if let Some(ref key) = target.endpoint.key {
        let value = HeaderValue::from_str(key).map_err(|_| {
            ProxyError::Config(format!(
                "endpoint '{}' has a key that is not a valid header value",
                target.endpoint.name
            ))
            .into_response()
        })?;
        headers.insert("api-key", value);
    } else {
        headers.remove("api-key");
        headers.remove("authorization");
        let bearer = state
            .token_source
            .bearer_header()
            .await
            .map_err(IntoResponse::into_response)?;
        let value = HeaderValue::from_str(&bearer).map_err(|_| {
            ProxyError::Internal("acquired token is not a valid header value".to_string())
                .into_response()
        })?;
        headers.insert("authorization", value);
    }
    Ok(headers)
}

/// Streaming requests always pass; non-streaming requests pass according to
/// the target's configured fraction, sampled uniformly.
fn passes_non_streaming_gate(
    non_streaming_requested: bool,
    fraction: f64,
    random: &dyn RandomSource,
) -> bool {
    if !non_streaming_requested {
        return true;
    }
    if fraction >= 1.0 {
        return true;
    }
    if fraction <= 0.0 {
        return false;
    }
    random.sample() <= fraction
}

/// Copy of the upstream headers, minus `Content-Length` when
/// `Transfer-Encoding` is also present.
fn downstream_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    if headers.contains_key("transfer-encoding") && headers.contains_key("content-length") {
        headers.remove("content-length");
    }
    headers
}

fn build_response(status: axum::http::StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = HttpResponse::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerproxy_core::clock::SequenceRandom;

    #[test]
    fn test_streaming_request_ignores_fraction() {
        let random = SequenceRandom::new(vec![0.99]);
        assert!(passes_non_streaming_gate(false, 0.0, &random));
        assert!(passes_non_streaming_gate(false, 0.3, &random));
    }

    #[test]
    fn test_non_streaming_fraction_edges() {
        let random = SequenceRandom::new(vec![0.99]);
        assert!(passes_non_streaming_gate(true, 1.0, &random));
        assert!(!passes_non_streaming_gate(true, 0.0, &random));
    }

    #[test]
    fn test_non_streaming_fraction_sampling() {
        // Sample below the fraction passes, above it skips.
        let random = SequenceRandom::new(vec![0.2, 0.8]);
        assert!(passes_non_streaming_gate(true, 0.5, &random));
        assert!(!passes_non_streaming_gate(true, 0.5, &random));
    }

    #[test]
    fn test_downstream_headers_drop_content_length_when_chunked() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-length", HeaderValue::from_static("10"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("x-ms-region", HeaderValue::from_static("eastus"));
        let headers = downstream_headers(&upstream);
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers.get("x-ms-region").unwrap(), "eastus");

        let mut plain = HeaderMap::new();
        plain.insert("content-length", HeaderValue::from_static("10"));
        let headers = downstream_headers(&plain);
        assert_eq!(headers.get("content-length").unwrap(), "10");
    }
}
