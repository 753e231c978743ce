//! Configuration for the WebExpose agent
//!
//! Settings come from an optional `webexpose.yml` and from command-line
//! flags; flags win over the file.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

/// Scheme used to reach the local service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocalScheme {
    #[default]
    Http,
    Https,
}

impl LocalScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalScheme::Http => "http",
            LocalScheme::Https => "https",
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay tunnel URL (ws://host:port/WSconnect)
    #[serde(default = "default_remote_url")]
    pub remote_url: String,

    /// Local host:port to forward requests to
    #[serde(default)]
    pub local_server: String,

    /// Scheme for the local service
    #[serde(default)]
    pub local_scheme: LocalScheme,

    /// Max local calls in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-call timeout for the local service
    #[serde(default = "default_local_timeout_ms")]
    pub local_timeout_ms: u64,

    /// Re-dial behaviour after the tunnel drops
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_remote_url() -> String {
    "ws://localhost:8080/WSconnect".to_string()
}

fn default_concurrency() -> usize {
    16
}

fn default_local_timeout_ms() -> u64 {
    60_000
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            local_server: String::new(),
            local_scheme: LocalScheme::default(),
            concurrency: default_concurrency(),
            local_timeout_ms: default_local_timeout_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.remote_url.starts_with("ws://") || self.remote_url.starts_with("wss://")) {
            anyhow::bail!("Remote URL must start with ws:// or wss://: {}", self.remote_url);
        }

        match self.local_server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => anyhow::bail!(
                "Local server must be host:port, got '{}'",
                self.local_server
            ),
        }

        if self.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        if self.local_timeout_ms == 0 {
            anyhow::bail!("Local timeout must be greater than zero");
        }
        if self.reconnect.initial_backoff_ms == 0
            || self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms
        {
            anyhow::bail!(
                "Invalid reconnect backoff: initial {}ms, max {}ms",
                self.reconnect.initial_backoff_ms,
                self.reconnect.max_backoff_ms
            );
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "webexpose.yml",
            "webexpose.yaml",
            ".webexpose.yml",
            ".webexpose.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[derive(Debug, Parser)]
#[command(name = "webexpose")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a WebExpose relay", long_about = None)]
pub struct Cli {
    /// Relay tunnel URL (ws://host:port/WSconnect)
    #[arg(short, long)]
    pub remote_url: Option<String>,

    /// Local host:port to connect to
    #[arg(short, long)]
    pub local_server: Option<String>,

    /// Scheme to use when connecting to the local server
    #[arg(long, value_enum)]
    pub local_scheme: Option<LocalScheme>,

    /// Max local calls in flight (1 = strictly sequential)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Path to a webexpose.yml config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Merge the config file (explicit or discovered) with flag overrides
    pub fn resolve(&self) -> Result<AgentConfig> {
        let path = self.config.clone().or_else(AgentConfig::find_config);
        let mut config = match path {
            Some(path) => AgentConfig::load(&path)?,
            None => AgentConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut AgentConfig) {
        if let Some(url) = &self.remote_url {
            config.remote_url = url.clone();
        }
        if let Some(server) = &self.local_server {
            config.local_server = server.clone();
        }
        if let Some(scheme) = self.local_scheme {
            config.local_scheme = scheme;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
remote_url: wss://relay.example.com/WSconnect
local_server: 127.0.0.1:3000
local_scheme: https
concurrency: 4
reconnect:
  initial_backoff_ms: 500
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.remote_url, "wss://relay.example.com/WSconnect");
        assert_eq!(config.local_scheme, LocalScheme::Https);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.reconnect.initial_backoff(), Duration::from_millis(500));
        assert_eq!(config.reconnect.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.local_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_file() {
        let cli = Cli::try_parse_from([
            "webexpose",
            "--local-server",
            "localhost:8000",
            "--local-scheme",
            "https",
            "--concurrency",
            "1",
        ])
        .unwrap();

        let mut config: AgentConfig = serde_yaml::from_str("local_server: other:9000\nconcurrency: 8\n").unwrap();
        cli.apply(&mut config);
        assert_eq!(config.local_server, "localhost:8000");
        assert_eq!(config.local_scheme, LocalScheme::Https);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.remote_url, "ws://localhost:8080/WSconnect");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let missing_local = AgentConfig::default();
        assert!(missing_local.validate().is_err());

        let bad_url = AgentConfig {
            remote_url: "http://relay/WSconnect".into(),
            local_server: "localhost:8000".into(),
            ..Default::default()
        };
        assert!(bad_url.validate().is_err());

        let bad_port = AgentConfig {
            local_server: "localhost:http".into(),
            ..Default::default()
        };
        assert!(bad_port.validate().is_err());

        let bad_backoff = AgentConfig {
            local_server: "localhost:8000".into(),
            reconnect: ReconnectConfig {
                initial_backoff_ms: 60_000,
                max_backoff_ms: 1_000,
            },
            ..Default::default()
        };
        assert!(bad_backoff.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AgentConfig::load(Path::new("/definitely/not/here.yml")).is_err());
    }
}
