use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde_json::json;

use powerproxy_core::clock::Clock;
use powerproxy_core::config::{Config, query};
use powerproxy_core::slip::RoutingSlip;

use crate::base::{HookError, HookResult, ImmediateResponse, ProxyPlugin};

// ─── Budget store ──────────────────────────────────────────────────────────

/// Key-value backend for the per-minute token budgets.
///
/// The remote backend owns the single-key read-modify-write semantics and is
/// the correctness path for multi-instance deployments; the local backend is
/// approximate under concurrent decrements by design.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, anyhow::Error>;
    async fn set(&self, key: &str, value: i64) -> Result<(), anyhow::Error>;
}

/// Process-local budget store.
pub struct LocalBudgetStore {
    map: DashMap<String, i64>,
}

impl LocalBudgetStore {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn boxed(self) -> Box<dyn BudgetStore> {
        Box::new(self)
    }
}

impl Default for LocalBudgetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BudgetStore for LocalBudgetStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, anyhow::Error> {
        Ok(self.map.get(key).map(|entry| *entry))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), anyhow::Error> {
        self.map.insert(key.to_string(), value);
        Ok(())
    }
}

/// Redis-backed budget store (TLS, port 6380).
pub struct RedisBudgetStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBudgetStore {
    pub async fn connect(host: &str, password: &str) -> Result<Self, anyhow::Error> {
        let url = format!("rediss://:{password}@{host}:6380/0");
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub fn boxed(self) -> Box<dyn BudgetStore> {
        Box::new(self)
    }
}

#[async_trait]
impl BudgetStore for RedisBudgetStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, anyhow::Error> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}

// ─── Plugin ────────────────────────────────────────────────────────────────

/// Limits the token usage rate per client and virtual deployment.
///
/// Budgets are fixed windows of one minute: the first request of a new
/// minute resets the stored budget to the configured maximum, every
/// completed request decrements it by its total tokens, and requests
/// arriving with a non-positive budget are rejected until the minute rolls.
pub struct LimitUsage {
    app_config: Arc<Config>,
    clock: Arc<dyn Clock>,
    store: Box<dyn BudgetStore>,
    /// Budgets resolved from client settings, per (client, deployment).
    resolved_budgets: DashMap<(String, String), i64>,
    redis_host: Option<String>,
}

impl LimitUsage {
    pub fn new(
        app_config: Arc<Config>,
        clock: Arc<dyn Clock>,
        store: Box<dyn BudgetStore>,
        settings: &serde_json::Value,
    ) -> Self {
        let redis_host = query(settings, "redis/redis_host")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            app_config,
            clock,
            store,
            resolved_budgets: DashMap::new(),
            redis_host,
        }
    }

    fn deployment_of(slip: &RoutingSlip) -> String {
        slip.virtual_deployment
            .clone()
            .unwrap_or_else(|| "none".to_string())
    }

    /// The full per-minute budget in tokens for (client, deployment), from
    /// the client's `max_tokens_per_minute_in_k` setting (scalar or
    /// per-deployment map, in thousands).
    fn max_tokens_per_minute(&self, client: &str, deployment: &str) -> Result<i64, HookError> {
        let cache_key = (client.to_string(), deployment.to_string());
        if let Some(budget) = self.resolved_budgets.get(&cache_key) {
            return Ok(*budget);
        }

        let setting = self
            .app_config
            .client_settings(client)
            .and_then(|s| s.get("max_tokens_per_minute_in_k"));

        let budget = match setting {
            Some(value) if value.is_number() => {
                (value.as_f64().unwrap_or(0.0) * 1000.0) as i64
            }
            Some(serde_json::Value::Object(by_deployment)) => {
                match by_deployment.get(deployment).and_then(|v| v.as_f64()) {
                    Some(thousands) => (thousands * 1000.0) as i64,
                    None => {
                        return Err(HookError::Immediate(ImmediateResponse::new(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            json!({
                                "error": format!(
                                    "Configuration for client '{client}' has a \
                                     'max_tokens_per_minute_in_k' setting but misses a \
                                     configuration for virtual deployment '{deployment}'. This \
                                     needs to be set when the LimitUsage plugin is enabled and \
                                     virtual deployment-specific limits are configured."
                                )
                            }),
                        )));
                    }
                }
            }
            _ => {
                return Err(HookError::Immediate(ImmediateResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": format!(
                            "Configuration for client '{client}' misses a \
                             'max_tokens_per_minute_in_k' setting. This needs to be set when \
                             the LimitUsage plugin is enabled."
                        )
                    }),
                )));
            }
        };

        self.resolved_budgets.insert(cache_key, budget);
        Ok(budget)
    }
}

#[async_trait]
impl ProxyPlugin for LimitUsage {
    fn name(&self) -> &'static str {
        "LimitUsage"
    }

    fn requires_token_counts(&self) -> bool {
        true
    }

    fn plugin_config_jsonschema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "$schema": "http://json-schema.org/draft/2019-09/schema#",
            "type": "object",
            "properties": {
                "redis": {
                    "type": "object",
                    "properties": {
                        "redis_host": {"type": "string"},
                        "redis_password": {"type": "string"}
                    },
                    "required": ["redis_host", "redis_password"]
                }
            }
        }))
    }

    fn client_config_jsonschema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "$schema": "http://json-schema.org/draft/2019-09/schema#",
            "type": "object",
            "properties": {
                "max_tokens_per_minute_in_k": {
                    "anyOf": [
                        {"type": "object", "additionalProperties": {"type": "number"}},
                        {"type": "number"}
                    ]
                }
            },
            "required": ["max_tokens_per_minute_in_k"]
        }))
    }

    fn on_print_configuration(&self) {
        tracing::info!(
            redis_host = self.redis_host.as_deref().unwrap_or("(none)"),
            "LimitUsage budget backend"
        );
    }

    async fn on_client_identified(&self, slip: &RoutingSlip) -> HookResult {
        let Some(ref client) = slip.client else {
            return Ok(());
        };
        let deployment = Self::deployment_of(slip);
        let minute_key = format!("LimitUsage-{client}-{deployment}-minute");
        let budget_key = format!("LimitUsage-{client}-{deployment}-budget");
        let current_minute = (self.clock.now_s() / 60) as i64;

        // Reset the window when the stored minute is absent or stale,
        // leaving a pre-existing budget for the current minute untouched.
        let stored_minute = self.store.get(&minute_key).await?;
        if stored_minute != Some(current_minute) {
            let full_budget = self.max_tokens_per_minute(client, &deployment)?;
            self.store.set(&minute_key, current_minute).await?;
            self.store.set(&budget_key, full_budget).await?;
        }

        let stored_minute = self.store.get(&minute_key).await?;
        let budget = self.store.get(&budget_key).await?.unwrap_or(0);
        if stored_minute == Some(current_minute) && budget <= 0 {
            return Err(HookError::Immediate(ImmediateResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "message": format!(
                        "Too many requests for client '{client}' / virtual deployment \
                         '{deployment}'. Try again later."
                    )
                }),
            )));
        }
        Ok(())
    }

    async fn on_token_counts_for_request_available(&self, slip: &RoutingSlip) -> HookResult {
        let Some(ref client) = slip.client else {
            return Ok(());
        };
        let deployment = Self::deployment_of(slip);
        let budget_key = format!("LimitUsage-{client}-{deployment}-budget");

        // The budget may go negative; the next minute resets it.
        let old_budget = self.store.get(&budget_key).await?.unwrap_or(0);
        self.store
            .set(&budget_key, old_budget - slip.usage.total_tokens as i64)
            .await?;
        Ok(())
    }
}
