use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::Stream;

use crate::config::{Config, EndpointConfig, MockResponseConfig};
use crate::error::ProxyError;

/// One configured upstream endpoint with its long-lived pooled HTTP client.
/// Distinct targets may share an endpoint and thus its connection pool.
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub key: Option<String>,
    client: UpstreamClient,
}

enum UpstreamClient {
    Http(reqwest::Client),
    /// In-process stand-in returning a fixed JSON body after an optional
    /// delay. Used when `aoai.mock_response` is configured.
    Mock {
        body: serde_json::Value,
        ms_to_wait_before_return: Option<f64>,
    },
}

impl Endpoint {
    fn from_config(config: &EndpointConfig) -> Result<Self, anyhow::Error> {
        let limits = &config.connections.limits;
        let timeouts = &config.connections.timeouts;
        // reqwest has no hard max-connections cap; the keepalive limits and
        // expiry map onto its pool settings, read/connect onto its timeouts.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(timeouts.connect))
            .read_timeout(Duration::from_secs_f64(timeouts.read))
            .pool_max_idle_per_host(limits.max_keepalive_connections as usize)
            .pool_idle_timeout(Duration::from_secs_f64(limits.keepalive_expiry))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build client for endpoint '{}': {e}", config.name))?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            client: UpstreamClient::Http(client),
        })
    }

    fn mock(config: &MockResponseConfig) -> Self {
        Self {
            name: "mock".to_string(),
            url: String::new(),
            key: None,
            client: UpstreamClient::Mock {
                body: config.json.clone(),
                ms_to_wait_before_return: config.ms_to_wait_before_return,
            },
        }
    }

    /// Forward a request to this endpoint. `path` must not carry a leading
    /// slash; `raw_query` is appended verbatim when non-empty.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        raw_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<TargetResponse, reqwest::Error> {
        match &self.client {
            UpstreamClient::Http(client) => {
                let mut url = format!("{}/{}", self.url, path);
                if !raw_query.is_empty() {
                    url.push('?');
                    url.push_str(raw_query);
                }
                let response = client
                    .request(method, url)
                    .headers(headers)
                    .body(body)
                    .send()
                    .await?;
                Ok(TargetResponse {
                    status: response.status(),
                    headers: response.headers().clone(),
                    body: TargetBody::Remote(response),
                })
            }
            UpstreamClient::Mock {
                body: json,
                ms_to_wait_before_return,
            } => {
                if let Some(ms) = ms_to_wait_before_return {
                    tokio::time::sleep(Duration::from_secs_f64(ms / 1_000.0)).await;
                }
                let payload = Bytes::from(json.to_string());
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("application/json"));
                Ok(TargetResponse {
                    status: StatusCode::OK,
                    headers,
                    body: TargetBody::Fixed(payload),
                })
            }
        }
    }
}

/// Status line, headers, and not-yet-consumed body of an upstream response.
pub struct TargetResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: TargetBody,
}

enum TargetBody {
    Remote(reqwest::Response),
    Fixed(Bytes),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

impl TargetResponse {
    /// Read the full response body.
    pub async fn bytes(self) -> Result<Bytes, ProxyError> {
        match self.body {
            TargetBody::Remote(response) => response
                .bytes()
                .await
                .map_err(|e| ProxyError::Internal(format!("failed to read upstream body: {e}"))),
            TargetBody::Fixed(bytes) => Ok(bytes),
        }
    }

    /// Consume the response into a byte stream.
    pub fn byte_stream(self) -> ByteStream {
        match self.body {
            TargetBody::Remote(response) => Box::pin(response.bytes_stream()),
            TargetBody::Fixed(bytes) => {
                Box::pin(futures::stream::iter([Ok::<_, reqwest::Error>(bytes)]))
            }
        }
    }

    /// Value of the `retry-after-ms` header, when present and well-formed.
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.headers
            .get("retry-after-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

// ─── Targets ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Endpoint,
    VirtualDeploymentStandin {
        virtual_deployment: String,
        standin: String,
    },
}

/// The dispatch engine's unit of selection. Everything except the cooldown
/// deadline is fixed at startup.
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    pub endpoint: Arc<Endpoint>,
    pub non_streaming_fraction: f64,
    cooldown_until_ms: AtomicU64,
}

impl Target {
    fn new(name: String, kind: TargetKind, endpoint: Arc<Endpoint>, fraction: f64) -> Self {
        Self {
            name,
            kind,
            endpoint,
            non_streaming_fraction: fraction,
            cooldown_until_ms: AtomicU64::new(0),
        }
    }

    /// Whether this target is still blocked at `now_ms`.
    ///
    /// Cooldowns are written by whichever request observed the back-pressure
    /// signal and read by every other request; stale reads only cause a brief
    /// over- or under-skip, so relaxed atomics suffice.
    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        now_ms < self.cooldown_until_ms.load(Ordering::Relaxed)
    }

    pub fn cooldown_until_ms(&self) -> u64 {
        self.cooldown_until_ms.load(Ordering::Relaxed)
    }

    pub fn set_cooldown_until(&self, deadline_ms: u64) {
        self.cooldown_until_ms.store(deadline_ms, Ordering::Relaxed);
    }

    /// Deployment gate: standin targets only serve their own virtual
    /// deployment; endpoint targets serve anything.
    pub fn serves_virtual_deployment(&self, requested: Option<&str>) -> bool {
        match &self.kind {
            TargetKind::Endpoint => true,
            TargetKind::VirtualDeploymentStandin {
                virtual_deployment, ..
            } => requested == Some(virtual_deployment.as_str()),
        }
    }

    pub fn standin_name(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Endpoint => None,
            TargetKind::VirtualDeploymentStandin { standin, .. } => Some(standin),
        }
    }

    pub fn virtual_deployment_name(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Endpoint => None,
            TargetKind::VirtualDeploymentStandin {
                virtual_deployment, ..
            } => Some(virtual_deployment),
        }
    }
}

/// All upstream targets in declaration order. Built once at startup and
/// never resized; only the per-target cooldown deadlines mutate afterwards.
pub struct TargetRegistry {
    pub targets: Vec<Target>,
    pub virtual_deployment_names: Vec<String>,
}

impl TargetRegistry {
    pub fn from_config(config: &Config) -> Result<Self, anyhow::Error> {
        if let Some(ref mock) = config.aoai.mock_response {
            let endpoint = Arc::new(Endpoint::mock(mock));
            return Ok(Self {
                targets: vec![Target::new(
                    "mock".to_string(),
                    TargetKind::Endpoint,
                    endpoint,
                    1.0,
                )],
                virtual_deployment_names: Vec::new(),
            });
        }

        let mut targets = Vec::new();
        let mut virtual_deployment_names: Vec<String> = Vec::new();
        for endpoint_config in &config.aoai.endpoints {
            let endpoint = Arc::new(Endpoint::from_config(endpoint_config)?);
            if endpoint_config.virtual_deployments.is_empty() {
                targets.push(Target::new(
                    endpoint_config.name.clone(),
                    TargetKind::Endpoint,
                    endpoint.clone(),
                    endpoint_config.non_streaming_fraction.unwrap_or(1.0),
                ));
                continue;
            }
            for vd in &endpoint_config.virtual_deployments {
                if !virtual_deployment_names.contains(&vd.name) {
                    virtual_deployment_names.push(vd.name.clone());
                }
                for standin in &vd.standins {
                    targets.push(Target::new(
                        format!("{}@{}@{}", standin.name, vd.name, endpoint_config.name),
                        TargetKind::VirtualDeploymentStandin {
                            virtual_deployment: vd.name.clone(),
                            standin: standin.name.clone(),
                        },
                        endpoint.clone(),
                        standin.non_streaming_fraction.unwrap_or(1.0),
                    ));
                }
            }
        }

        Ok(Self {
            targets,
            virtual_deployment_names,
        })
    }

    /// Whether the requested virtual deployment is configured. Always true
    /// when no virtual deployments exist at all.
    pub fn knows_virtual_deployment(&self, requested: Option<&str>) -> bool {
        if self.virtual_deployment_names.is_empty() {
            return true;
        }
        matches!(requested, Some(name) if self.virtual_deployment_names.iter().any(|n| n == name))
    }
}
