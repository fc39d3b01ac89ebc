use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use powerproxy_core::error::ProxyError;
use powerproxy_core::slip::RoutingSlip;

use crate::token_count::TokenCounter;

/// A fully-formed response a plugin wants returned to the caller instead of
/// continuing the request.
#[derive(Debug)]
pub struct ImmediateResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl ImmediateResponse {
    pub fn new(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }
}

impl IntoResponse for ImmediateResponse {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [("content-type", "application/json")],
            self.body.to_string(),
        )
            .into_response();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (name.parse(), value.parse()) {
                response.headers_mut().append::<axum::http::HeaderName>(name, value);
            }
        }
        response
    }
}

/// A hook either continues the chain, short-circuits with a response, or
/// fails the request. The short-circuit is a tagged return, not an unwind.
#[derive(Debug)]
pub enum HookError {
    Immediate(ImmediateResponse),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for HookError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for HookError {
    fn into_response(self) -> Response {
        match self {
            Self::Immediate(response) => response.into_response(),
            Self::Internal(e) => ProxyError::Internal(e.to_string()).into_response(),
        }
    }
}

pub type HookResult = Result<(), HookError>;

/// Lifecycle hook sites, in per-request firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    NewRequestReceived,
    ClientIdentified,
    HeadersFromTargetReceived,
    BodyDictFromTargetAvailable,
    DataEventFromTargetReceived,
    TokenCountsForRequestAvailable,
    EndOfTargetResponseStreamReached,
}

/// A proxy plugin. Instances live for the process lifetime and observe every
/// request through the hook methods; per-request state belongs on the
/// routing slip, not on the plugin.
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this plugin consumes the token counters on the slip. The host
    /// only runs the counting machinery when at least one plugin does.
    fn requires_token_counts(&self) -> bool {
        false
    }

    /// JSON Schema for this plugin's own configuration block.
    fn plugin_config_jsonschema(&self) -> Option<serde_json::Value> {
        None
    }

    /// JSON Schema for the per-client config slice this plugin reads.
    fn client_config_jsonschema(&self) -> Option<serde_json::Value> {
        None
    }

    /// One-shot startup, after construction.
    fn on_plugin_instantiated(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Diagnostic enumeration of the plugin's effective settings.
    fn on_print_configuration(&self) {}

    async fn on_new_request_received(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_client_identified(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_headers_from_target_received(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_body_dict_from_target_available(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_data_event_from_target_received(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_token_counts_for_request_available(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }

    async fn on_end_of_target_response_stream_reached(&self, _slip: &RoutingSlip) -> HookResult {
        Ok(())
    }
}

/// Ordered collection of plugin instances plus the hook dispatcher.
pub struct PluginHost {
    plugins: Vec<Arc<dyn ProxyPlugin>>,
    token_counter: Option<TokenCounter>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.plugin_names())
            .field("token_counter", &self.token_counter.is_some())
            .finish()
    }
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn ProxyPlugin>>, token_counter: Option<TokenCounter>) -> Self {
        Self {
            plugins,
            token_counter,
        }
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn requires_token_counts(&self) -> bool {
        self.token_counter.is_some()
    }

    /// Invoke the given hook on every plugin in configuration-declaration
    /// order, stopping at the first plugin that short-circuits or fails.
    pub async fn fire(&self, hook: Hook, slip: &RoutingSlip) -> HookResult {
        for plugin in &self.plugins {
            match hook {
                Hook::NewRequestReceived => plugin.on_new_request_received(slip).await?,
                Hook::ClientIdentified => plugin.on_client_identified(slip).await?,
                Hook::HeadersFromTargetReceived => {
                    plugin.on_headers_from_target_received(slip).await?
                }
                Hook::BodyDictFromTargetAvailable => {
                    plugin.on_body_dict_from_target_available(slip).await?
                }
                Hook::DataEventFromTargetReceived => {
                    plugin.on_data_event_from_target_received(slip).await?
                }
                Hook::TokenCountsForRequestAvailable => {
                    plugin.on_token_counts_for_request_available(slip).await?
                }
                Hook::EndOfTargetResponseStreamReached => {
                    plugin.on_end_of_target_response_stream_reached(slip).await?
                }
            }
        }
        Ok(())
    }

    /// Fill the slip's counters from a buffered upstream body.
    pub fn apply_body_token_counts(&self, slip: &mut RoutingSlip) {
        if let Some(ref counter) = self.token_counter {
            counter.apply_body_counts(slip);
        }
    }

    /// Accumulate the current streamed data event into the slip's counters.
    pub fn accumulate_stream_tokens(&self, slip: &mut RoutingSlip) {
        if let Some(ref counter) = self.token_counter {
            counter.accumulate_data_event(slip);
        }
    }

    /// Derive final counters from the accumulated stream content.
    pub fn finalize_stream_token_counts(&self, slip: &mut RoutingSlip) {
        if let Some(ref counter) = self.token_counter {
            counter.finalize_stream_counts(slip);
        }
    }

    /// Diagnostic enumeration of all plugins, at startup.
    pub fn print_configuration(&self) {
        for plugin in &self.plugins {
            tracing::info!(plugin = plugin.name(), "Plugin enabled");
            plugin.on_print_configuration();
        }
    }
}
