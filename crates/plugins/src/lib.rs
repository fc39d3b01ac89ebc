pub mod allow_deployments;
pub mod base;
pub mod limit_usage;
pub mod log_usage;
pub mod token_count;

use std::sync::Arc;

use powerproxy_core::clock::Clock;
use powerproxy_core::config::{Config, query};
use powerproxy_core::token::TokenSource;

use crate::allow_deployments::AllowDeployments;
use crate::base::{PluginHost, ProxyPlugin};
use crate::limit_usage::{LimitUsage, LocalBudgetStore, RedisBudgetStore};
use crate::log_usage::{ConsoleSink, CsvFileSink, LogIngestionSink, LogUsage};
use crate::token_count::TokenCounter;

/// Instantiate all configured plugins in declaration order and assemble the
/// host. Config slices are checked against each plugin's JSON Schemas;
/// violations are logged, and surface per-request where the plugin logic
/// requires the missing setting.
pub async fn build_host(
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    token_source: Arc<dyn TokenSource>,
) -> Result<PluginHost, anyhow::Error> {
    let mut plugins: Vec<Arc<dyn ProxyPlugin>> = Vec::new();

    for plugin_config in &config.plugins {
        let settings = serde_json::Value::Object(plugin_config.settings.clone());
        let plugin: Arc<dyn ProxyPlugin> = match plugin_config.name.as_str() {
            "AllowDeployments" => Arc::new(AllowDeployments::new(config.clone())),
            "LimitUsage" => {
                let store = match query(&settings, "redis") {
                    Some(redis_settings) => {
                        let host = redis_settings
                            .get("redis_host")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| anyhow::anyhow!("LimitUsage redis config misses 'redis_host'"))?;
                        let password = redis_settings
                            .get("redis_password")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| anyhow::anyhow!("LimitUsage redis config misses 'redis_password'"))?;
                        RedisBudgetStore::connect(host, password).await?.boxed()
                    }
                    None => LocalBudgetStore::new().boxed(),
                };
                Arc::new(LimitUsage::new(config.clone(), clock.clone(), store, &settings))
            }
            "LogUsageToConsole" => Arc::new(LogUsage::new(Box::new(ConsoleSink))),
            "LogUsageToCsvFile" => {
                let log_dir = query(&settings, "log_dir")
                    .and_then(|v| v.as_str())
                    .unwrap_or("logs");
                Arc::new(LogUsage::new(Box::new(CsvFileSink::new(log_dir)?)))
            }
            "LogUsageToLogIngestion" => {
                let sink = LogIngestionSink::from_settings(&settings, token_source.clone())?;
                Arc::new(LogUsage::new(Box::new(sink)))
            }
            other => anyhow::bail!("unknown plugin '{other}'"),
        };

        validate_config_slices(&config, plugin.as_ref(), &settings);
        plugin.on_plugin_instantiated()?;
        plugins.push(plugin);
    }

    let token_counter = if plugins.iter().any(|p| p.requires_token_counts()) {
        Some(TokenCounter::new()?)
    } else {
        None
    };

    Ok(PluginHost::new(plugins, token_counter))
}

fn validate_config_slices(config: &Config, plugin: &dyn ProxyPlugin, settings: &serde_json::Value) {
    if let Some(schema) = plugin.plugin_config_jsonschema() {
        if let Some(problem) = schema_violation(&schema, settings) {
            tracing::warn!(
                plugin = plugin.name(),
                "Plugin configuration does not match its schema: {problem}"
            );
        }
    }
    if let Some(schema) = plugin.client_config_jsonschema() {
        for client in &config.clients {
            let slice = serde_json::Value::Object(client.settings.clone());
            if let Some(problem) = schema_violation(&schema, &slice) {
                tracing::warn!(
                    plugin = plugin.name(),
                    client = %client.name,
                    "Client configuration does not match the plugin's schema: {problem}"
                );
            }
        }
    }
}

fn schema_violation(schema: &serde_json::Value, instance: &serde_json::Value) -> Option<String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator
            .iter_errors(instance)
            .next()
            .map(|e| e.to_string()),
        Err(e) => Some(format!("invalid schema: {e}")),
    }
}
