use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ─── Config ────────────────────────────────────────────────────────────────

/// Immutable configuration snapshot, loaded once at startup.
///
/// The document can come from a YAML file (`--config-file`) or from an
/// environment variable holding the full configuration as JSON
/// (`--config-env-var`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aoai: AoaiConfig,
    pub clients: Vec<ClientConfig>,
    pub plugins: Vec<PluginConfig>,
    pub opensource_deployments: Vec<String>,
    /// Request body size limit (MB).
    pub body_limit_mb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aoai: AoaiConfig::default(),
            clients: Vec::new(),
            plugins: Vec::new(),
            opensource_deployments: Vec::new(),
            body_limit_mb: 10,
        }
    }
}

impl Config {
    /// Load config from a YAML file and validate.
    pub fn from_file(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml_ng::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from the JSON content of the named environment variable.
    pub fn from_env_var(name: &str) -> Result<Self, anyhow::Error> {
        let contents = std::env::var(name)
            .map_err(|_| anyhow::anyhow!("environment variable '{name}' is not set"))?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    fn validate(&self) -> Result<(), anyhow::Error> {
        let mut endpoint_names = HashSet::new();
        for endpoint in &self.aoai.endpoints {
            anyhow::ensure!(!endpoint.url.is_empty(), "endpoint '{}' has an empty url", endpoint.name);
            anyhow::ensure!(
                endpoint_names.insert(endpoint.name.as_str()),
                "duplicate endpoint name '{}'",
                endpoint.name
            );
            for fraction in endpoint.fractions() {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&fraction),
                    "non_streaming_fraction {fraction} on endpoint '{}' is outside [0, 1]",
                    endpoint.name
                );
            }
        }

        let mut client_names = HashSet::new();
        for client in &self.clients {
            anyhow::ensure!(
                client_names.insert(client.name.as_str()),
                "duplicate client name '{}'",
                client.name
            );
        }

        let entra_clients = self
            .clients
            .iter()
            .filter(|c| c.uses_entra_id_auth)
            .count();
        anyhow::ensure!(
            entra_clients <= 1,
            "at most one client may set uses_entra_id_auth, found {entra_clients}"
        );

        Ok(())
    }

    /// Map of configured API key to owning client name.
    pub fn key_client_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for client in &self.clients {
            for key in &client.api_keys {
                map.insert(key.clone(), client.name.clone());
            }
        }
        map
    }

    /// The single client configured for Entra ID authentication, if any.
    pub fn entra_id_client(&self) -> Option<&ClientConfig> {
        self.clients.iter().find(|c| c.uses_entra_id_auth)
    }

    /// Settings map of the named client.
    pub fn client_settings(&self, name: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.clients
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.settings)
    }
}

/// Walk a `/`-separated path through nested JSON objects.
pub fn query<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('/') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

// ─── Upstream endpoints ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AoaiConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub mock_response: Option<MockResponseConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub key: Option<String>,
    pub virtual_deployments: Vec<VirtualDeploymentConfig>,
    pub non_streaming_fraction: Option<f64>,
    pub connections: ConnectionsConfig,
}

impl EndpointConfig {
    fn fractions(&self) -> impl Iterator<Item = f64> + '_ {
        self.non_streaming_fraction.into_iter().chain(
            self.virtual_deployments
                .iter()
                .flat_map(|vd| vd.standins.iter().filter_map(|s| s.non_streaming_fraction)),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualDeploymentConfig {
    pub name: String,
    pub standins: Vec<StandinConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandinConfig {
    pub name: String,
    #[serde(default)]
    pub non_streaming_fraction: Option<f64>,
}

/// Fixed response served instead of any real upstream, for load tests and
/// local development.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockResponseConfig {
    pub json: serde_json::Value,
    #[serde(default)]
    pub ms_to_wait_before_return: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    pub limits: ConnectionLimits,
    pub timeouts: ConnectionTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    pub max_keepalive_connections: u32,
    pub max_connections: u32,
    /// Keepalive expiry in seconds.
    pub keepalive_expiry: f64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_keepalive_connections: 20,
            max_connections: 100,
            keepalive_expiry: 5.0,
        }
    }
}

/// Upstream timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionTimeouts {
    pub connect: f64,
    pub read: f64,
    pub write: f64,
    pub pool: f64,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: 15.0,
            read: 120.0,
            write: 120.0,
            pool: 120.0,
        }
    }
}

// ─── Clients & plugins ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub uses_entra_id_auth: bool,
    /// Plugin-interpreted settings (e.g. `deployments_allowed`,
    /// `max_tokens_per_minute_in_k`).
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_yaml_deserialization() {
        let config = parse(
            r#"
aoai:
  endpoints:
    - name: primary
      url: "https://primary.openai.azure.com"
      key: "ep-key"
      non_streaming_fraction: 0.5
      virtual_deployments:
        - name: gpt
          standins:
            - name: gpt-4o-eastus
            - name: gpt-4o-westus
              non_streaming_fraction: 0
clients:
  - name: Team 1
    api_keys: ["key-1", "key-1b"]
    deployments_allowed: gpt
  - name: Team 2
    uses_entra_id_auth: true
plugins:
  - name: AllowDeployments
opensource_deployments:
  - llama3
"#,
        );
        assert_eq!(config.aoai.endpoints.len(), 1);
        let endpoint = &config.aoai.endpoints[0];
        assert_eq!(endpoint.name, "primary");
        assert_eq!(endpoint.key.as_deref(), Some("ep-key"));
        assert_eq!(endpoint.non_streaming_fraction, Some(0.5));
        assert_eq!(endpoint.virtual_deployments[0].standins.len(), 2);
        assert_eq!(
            endpoint.virtual_deployments[0].standins[1].non_streaming_fraction,
            Some(0.0)
        );
        assert_eq!(config.clients.len(), 2);
        assert_eq!(
            config.clients[0].settings["deployments_allowed"],
            serde_json::json!("gpt")
        );
        assert_eq!(config.plugins[0].name, "AllowDeployments");
        assert_eq!(config.opensource_deployments, vec!["llama3"]);
    }

    #[test]
    fn test_body_limit_default() {
        let config = parse("clients: []\n");
        assert_eq!(config.body_limit_mb, 10);
        let config = parse("body_limit_mb: 32\n");
        assert_eq!(config.body_limit_mb, 32);
    }

    #[test]
    fn test_connection_defaults() {
        let endpoint = EndpointConfig::default();
        assert_eq!(endpoint.connections.limits.max_keepalive_connections, 20);
        assert_eq!(endpoint.connections.limits.max_connections, 100);
        assert_eq!(endpoint.connections.limits.keepalive_expiry, 5.0);
        assert_eq!(endpoint.connections.timeouts.connect, 15.0);
        assert_eq!(endpoint.connections.timeouts.read, 120.0);
        assert_eq!(endpoint.connections.timeouts.write, 120.0);
        assert_eq!(endpoint.connections.timeouts.pool, 120.0);
    }

    #[test]
    fn test_key_client_map_and_entra_lookup() {
        let config = parse(
            r#"
clients:
  - name: A
    api_keys: ["ka"]
  - name: B
    api_keys: ["kb1", "kb2"]
    uses_entra_id_auth: true
"#,
        );
        let map = config.key_client_map();
        assert_eq!(map["ka"], "A");
        assert_eq!(map["kb1"], "B");
        assert_eq!(map["kb2"], "B");
        assert_eq!(config.entra_id_client().unwrap().name, "B");
    }

    #[test]
    fn test_validate_rejects_duplicate_clients() {
        let config = parse("clients:\n  - name: A\n  - name: A\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_two_entra_clients() {
        let config = parse(
            "clients:\n  - name: A\n    uses_entra_id_auth: true\n  - name: B\n    uses_entra_id_auth: true\n",
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_fraction() {
        let config = parse(
            "aoai:\n  endpoints:\n    - name: e\n      url: \"https://e\"\n      non_streaming_fraction: 1.5\n",
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_query_walks_nested_objects() {
        let value = serde_json::json!({
            "redis": { "host": "cache.example.net", "password": "s" }
        });
        assert_eq!(
            query(&value, "redis/host").and_then(|v| v.as_str()),
            Some("cache.example.net")
        );
        assert!(query(&value, "redis/port").is_none());
        assert!(query(&value, "missing/host").is_none());
    }

    #[test]
    fn test_from_env_var_json() {
        unsafe {
            std::env::set_var(
                "POWERPROXY_TEST_CONFIG",
                r#"{"clients": [{"name": "A", "api_keys": ["k"]}]}"#,
            );
        }
        let config = Config::from_env_var("POWERPROXY_TEST_CONFIG").unwrap();
        assert_eq!(config.clients[0].name, "A");
        assert!(Config::from_env_var("POWERPROXY_TEST_CONFIG_MISSING").is_err());
    }
}
