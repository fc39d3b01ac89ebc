use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;

use powerproxy_core::config::Config;
use powerproxy_core::slip::RoutingSlip;

use crate::base::{HookError, HookResult, ImmediateResponse, ProxyPlugin};

/// Blocks the usage of deployments that are not allowed for the client.
///
/// Allowed deployments are listed in the client's `deployments_allowed`
/// setting, either as a comma-separated string or as a list of strings.
/// Access is denied when the setting is missing.
pub struct AllowDeployments {
    app_config: Arc<Config>,
}

impl AllowDeployments {
    pub fn new(app_config: Arc<Config>) -> Self {
        Self { app_config }
    }

    fn deployments_allowed(&self, client: &str) -> Vec<String> {
        let setting = self
            .app_config
            .client_settings(client)
            .and_then(|s| s.get("deployments_allowed"));
        match setting {
            Some(serde_json::Value::String(list)) => list
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl ProxyPlugin for AllowDeployments {
    fn name(&self) -> &'static str {
        "AllowDeployments"
    }

    fn client_config_jsonschema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "$schema": "http://json-schema.org/draft/2019-09/schema#",
            "type": "object",
            "properties": {
                "deployments_allowed": {
                    "anyOf": [
                        {"type": "array", "items": {"type": "string"}},
                        {"type": "string"},
                        {"type": "null"}
                    ]
                }
            },
            "required": ["deployments_allowed"]
        }))
    }

    async fn on_client_identified(&self, slip: &RoutingSlip) -> HookResult {
        let Some(ref client) = slip.client else {
            return Ok(());
        };
        let requested = slip.virtual_deployment.as_deref().unwrap_or("none");
        let allowed = self.deployments_allowed(client);

        if !allowed.iter().any(|d| d == requested) {
            return Err(HookError::Immediate(ImmediateResponse::new(
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": format!(
                        "Access to requested deployment '{requested}' is denied. The PowerProxy \
                         configuration for client '{client}' misses a 'deployments_allowed' setting \
                         which includes that deployment. This needs to be set when the \
                         AllowDeployments plugin is enabled."
                    )
                }),
            )));
        }
        Ok(())
    }
}
