//! CLI argument surface.

use clap::Parser;

/// Unknown flags are accepted and ignored so that orchestration layers can
/// pass extra arguments through.
#[derive(Parser, Debug)]
#[command(
    name = "powerproxy",
    version,
    about = "Reverse proxy for Azure OpenAI-compatible inference endpoints",
    ignore_errors = true
)]
pub struct Cli {
    /// Path to config file
    #[arg(long, default_value = "config.yaml", env = "POWERPROXY_CONFIG_FILE")]
    pub config_file: String,

    /// Name of the environment variable containing the configuration as JSON
    /// string (takes precedence over --config-file)
    #[arg(long, env = "POWERPROXY_CONFIG_ENV_VAR")]
    pub config_env_var: Option<String>,

    /// Port where the proxy runs. Ports <= 1024 may need special permissions
    /// on Linux.
    #[arg(long, default_value_t = 80, env = "POWERPROXY_PORT")]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["powerproxy"]);
        assert_eq!(cli.config_file, "config.yaml");
        assert_eq!(cli.config_env_var, None);
        assert_eq!(cli.port, 80);
    }

    #[test]
    fn test_explicit_flags() {
        let cli = Cli::parse_from([
            "powerproxy",
            "--config-file",
            "/etc/powerproxy/config.yaml",
            "--port",
            "8080",
        ]);
        assert_eq!(cli.config_file, "/etc/powerproxy/config.yaml");
        assert_eq!(cli.port, 8080);
    }

    #[test]
    fn test_unknown_flags_are_ignored() {
        let cli = Cli::parse_from(["powerproxy", "--port", "8080", "--not-a-real-flag"]);
        assert_eq!(cli.port, 8080);
    }
}
