//! Application assembly and serving.

use std::sync::Arc;

use crate::cli::Cli;
use powerproxy_core::clock::{SystemClock, ThreadRngSource};
use powerproxy_core::config::Config;
use powerproxy_core::metrics::Metrics;
use powerproxy_core::target::TargetRegistry;
use powerproxy_core::token::{EntraTokenSource, TokenSource};
use powerproxy_server::AppState;

pub struct Application {
    router: axum::Router,
    port: u16,
}

impl Application {
    /// Load the config snapshot and wire the target registry, plugin host,
    /// and router together.
    pub async fn build(cli: &Cli) -> anyhow::Result<Self> {
        let config = match cli.config_env_var {
            Some(ref name) => Config::from_env_var(name)?,
            None => Config::from_file(&cli.config_file)?,
        };
        let config = Arc::new(config);

        tracing::info!(
            "PowerProxy for Azure OpenAI - v{}, port {}",
            env!("CARGO_PKG_VERSION"),
            cli.port,
        );

        let registry = Arc::new(TargetRegistry::from_config(&config)?);
        if config.aoai.mock_response.is_some() {
            tracing::info!("Mock mode: all requests answered by the in-process mock target");
        } else {
            tracing::info!(
                "Loaded {} endpoints, {} targets, {} clients",
                config.aoai.endpoints.len(),
                registry.targets.len(),
                config.clients.len(),
            );
        }

        let clock = Arc::new(SystemClock);
        let token_source: Arc<dyn TokenSource> = Arc::new(EntraTokenSource::from_environment()?);

        let plugins = powerproxy_plugins::build_host(
            config.clone(),
            clock.clone(),
            token_source.clone(),
        )
        .await?;
        plugins.print_configuration();

        let key_client_map = Arc::new(config.key_client_map());
        let state = AppState {
            config,
            registry,
            plugins: Arc::new(plugins),
            token_source,
            clock,
            random: Arc::new(ThreadRngSource),
            metrics: Arc::new(Metrics::new()),
            key_client_map,
        };

        Ok(Self {
            router: powerproxy_server::build_router(state),
            port: cli.port,
        })
    }

    /// Bind and serve until interrupted, then drain gracefully.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Serving incoming requests on {addr}");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received, draining connections...");
            })
            .await?;

        tracing::info!("Server shut down.");
        Ok(())
    }
}
