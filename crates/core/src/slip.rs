use std::sync::LazyLock;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;

/// First path segment following a literal `deployments/` segment.
static DEPLOYMENT_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"deployments/([^/]+)").unwrap());

/// Deployment path segment, for standin substitution.
static DEPLOYMENT_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/deployments/[^/]+").unwrap());

/// Deployment id as recorded in usage logs.
static DEPLOYMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*/deployments/([a-zA-Z0-9_-]+)/.*").unwrap());

/// Token counters for one request.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Completion text accumulated from streamed deltas, encoded at end of
    /// stream to derive `completion_tokens`.
    pub streamed_content: String,
}

/// The upstream target a request was actually forwarded to.
#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    pub endpoint: String,
    pub virtual_deployment: Option<String>,
    pub standin: Option<String>,
}

/// Per-request context shared across plugin hooks.
///
/// The dispatch engine is the single writer; plugins observe the slip
/// through `&RoutingSlip` at each hook site.
#[derive(Debug)]
pub struct RoutingSlip {
    pub request_received_utc: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    pub raw_query: String,
    pub api_version: String,
    /// Incoming headers with `Host` and `Content-Length` stripped.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_json: Option<serde_json::Value>,
    pub virtual_deployment: Option<String>,
    pub client: Option<String>,
    pub non_streaming_requested: bool,
    pub upstream: Option<SelectedUpstream>,
    pub request_start_ms: u64,
    pub request_end_ms: Option<u64>,
    pub roundtrip_time_ms: Option<u64>,
    pub time_to_response_ms: Option<u64>,
    pub headers_from_target: Option<HeaderMap>,
    /// The header set the proxy returns downstream (the upstream headers
    /// after the Transfer-Encoding/Content-Length adjustment).
    pub response_headers_from_target: Option<HeaderMap>,
    pub is_event_stream: bool,
    pub body_dict_from_target: Option<serde_json::Value>,
    /// Payload of the SSE data line currently being relayed.
    pub data_from_target: Option<String>,
    pub usage: TokenUsage,
}

impl RoutingSlip {
    /// Assemble a slip from the incoming request parts. Resolves the virtual
    /// deployment, the requested API version, and the streaming predicate.
    pub fn new(
        method: Method,
        path: String,
        raw_query: String,
        mut headers: HeaderMap,
        body: Bytes,
        opensource_deployments: &[String],
        request_received_utc: DateTime<Utc>,
        request_start_ms: u64,
    ) -> Self {
        headers.remove("host");
        headers.remove("content-length");

        let body_json: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let virtual_deployment =
            extract_virtual_deployment(&path, body_json.as_ref(), opensource_deployments);
        let non_streaming_requested = !is_streaming_requested(body_json.as_ref());
        let api_version = query_param(&raw_query, "api-version").unwrap_or_default();

        Self {
            request_received_utc,
            method,
            path,
            raw_query,
            api_version,
            headers,
            body,
            body_json,
            virtual_deployment,
            client: None,
            non_streaming_requested,
            upstream: None,
            request_start_ms,
            request_end_ms: None,
            roundtrip_time_ms: None,
            time_to_response_ms: None,
            headers_from_target: None,
            response_headers_from_target: None,
            is_event_stream: false,
            body_dict_from_target: None,
            data_from_target: None,
            usage: TokenUsage::default(),
        }
    }

    /// Replace the deployment path segment with the standin's name.
    pub fn rewrite_path_for_standin(&mut self, standin: &str) {
        self.path = DEPLOYMENT_PATH
            .replace(&self.path, format!("/deployments/{standin}"))
            .into_owned();
    }

    /// Record end-of-forwarding time and the resulting roundtrip duration.
    pub fn measure_roundtrip(&mut self, now_ms: u64) {
        self.request_end_ms = Some(now_ms);
        self.roundtrip_time_ms = Some(now_ms.saturating_sub(self.request_start_ms));
    }

    /// The deployment id the upstream actually saw, from the (possibly
    /// standin-rewritten) path.
    pub fn deployment_id(&self) -> Option<&str> {
        DEPLOYMENT_ID
            .captures(&self.path)
            .map(|c| c.get(1).map_or("", |m| m.as_str()))
    }

    /// Upstream region, from the `x-ms-region` response header.
    pub fn region_from_target(&self) -> Option<String> {
        self.headers_from_target
            .as_ref()
            .and_then(|h| h.get("x-ms-region"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Resolve the virtual deployment: the path segment after `deployments/`,
/// else a body-level `model` that names a configured opensource deployment.
pub fn extract_virtual_deployment(
    path: &str,
    body_json: Option<&serde_json::Value>,
    opensource_deployments: &[String],
) -> Option<String> {
    if let Some(captures) = DEPLOYMENT_SEGMENT.captures(path) {
        return captures.get(1).map(|m| m.as_str().to_string());
    }
    let model = body_json?.get("model")?.as_str()?;
    if opensource_deployments.iter().any(|d| d == model) {
        return Some(model.to_string());
    }
    None
}

/// Whether the request body asks for a streamed response. Absent or
/// non-boolean `stream` fields count as non-streaming.
pub fn is_streaming_requested(body_json: Option<&serde_json::Value>) -> bool {
    body_json
        .and_then(|b| b.get("stream"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn query_param(raw_query: &str, name: &str) -> Option<String> {
    raw_query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn make_slip(path: &str, raw_query: &str, body: &str) -> RoutingSlip {
        RoutingSlip::new(
            Method::POST,
            path.to_string(),
            raw_query.to_string(),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
            &["llama3".to_string()],
            Utc::now(),
            1_000,
        )
    }

    #[test]
    fn test_extracts_deployment_from_path() {
        let slip = make_slip("openai/deployments/gpt-4o/chat/completions", "", "{}");
        assert_eq!(slip.virtual_deployment.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_extracts_opensource_deployment_from_body_model() {
        let slip = make_slip("v1/chat/completions", "", r#"{"model": "llama3"}"#);
        assert_eq!(slip.virtual_deployment.as_deref(), Some("llama3"));

        let slip = make_slip("v1/chat/completions", "", r#"{"model": "gpt-4o"}"#);
        assert_eq!(slip.virtual_deployment, None);
    }

    #[test]
    fn test_streaming_predicate_defaults_to_non_streaming() {
        assert!(make_slip("p", "", "{}").non_streaming_requested);
        assert!(make_slip("p", "", "not json").non_streaming_requested);
        assert!(make_slip("p", "", r#"{"stream": false}"#).non_streaming_requested);
        assert!(!make_slip("p", "", r#"{"stream": true}"#).non_streaming_requested);
    }

    #[test]
    fn test_api_version_extraction() {
        let slip = make_slip("p", "api-version=2024-02-01&foo=bar", "{}");
        assert_eq!(slip.api_version, "2024-02-01");
        let slip = make_slip("p", "foo=bar", "{}");
        assert_eq!(slip.api_version, "");
    }

    #[test]
    fn test_strips_host_and_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("api-key", HeaderValue::from_static("k"));
        let slip = RoutingSlip::new(
            Method::POST,
            "p".into(),
            String::new(),
            headers,
            Bytes::new(),
            &[],
            Utc::now(),
            0,
        );
        assert!(slip.headers.get("host").is_none());
        assert!(slip.headers.get("content-length").is_none());
        assert!(slip.headers.get("api-key").is_some());
    }

    #[test]
    fn test_rewrite_path_for_standin() {
        let mut slip = make_slip("openai/deployments/gpt/chat/completions", "", "{}");
        slip.rewrite_path_for_standin("gpt-4o-eastus");
        assert_eq!(slip.path, "openai/deployments/gpt-4o-eastus/chat/completions");
    }

    #[test]
    fn test_deployment_id_reflects_rewritten_path() {
        let mut slip = make_slip("openai/deployments/gpt/chat/completions", "", "{}");
        assert_eq!(slip.deployment_id(), Some("gpt"));
        slip.rewrite_path_for_standin("gpt-4o-eastus");
        assert_eq!(slip.deployment_id(), Some("gpt-4o-eastus"));

        let slip = make_slip("v1/chat/completions", "", "{}");
        assert_eq!(slip.deployment_id(), None);
    }

    #[test]
    fn test_measure_roundtrip() {
        let mut slip = make_slip("p", "", "{}");
        slip.measure_roundtrip(1_350);
        assert_eq!(slip.request_end_ms, Some(1_350));
        assert_eq!(slip.roundtrip_time_ms, Some(350));
    }

    #[test]
    fn test_region_from_target() {
        let mut slip = make_slip("p", "", "{}");
        assert_eq!(slip.region_from_target(), None);
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-region", HeaderValue::from_static("eastus"));
        slip.headers_from_target = Some(headers);
        assert_eq!(slip.region_from_target().as_deref(), Some("eastus"));
    }
}
