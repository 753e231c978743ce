//! Relay configuration
//!
//! Command-line flags with environment fallbacks.

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TUNNEL_PATH: &str = "/WSconnect";
pub const DEFAULT_HEALTH_PATH: &str = "/_webexpose/health";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "webexpose-relay")]
#[command(version)]
#[command(about = "Public relay that forwards HTTP requests through a tunnel", long_about = None)]
pub struct RelayConfig {
    /// Port for both public HTTP traffic and the tunnel connection
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "WEBEXPOSE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Path the agent connects to; never proxied
    #[arg(long, env = "WEBEXPOSE_TUNNEL_PATH", default_value = DEFAULT_TUNNEL_PATH)]
    pub tunnel_path: String,

    /// Health endpoint path; never proxied
    #[arg(long, env = "WEBEXPOSE_HEALTH_PATH", default_value = DEFAULT_HEALTH_PATH)]
    pub health_path: String,

    /// How long a public request waits for the agent's response
    #[arg(long, env = "WEBEXPOSE_REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,

    /// Largest request body accepted from public clients
    #[arg(long, env = "WEBEXPOSE_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tunnel_path: DEFAULT_TUNNEL_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            verbose: false,
        }
    }
}

impl RelayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, path) in [("tunnel", &self.tunnel_path), ("health", &self.health_path)] {
            if !path.starts_with('/') {
                anyhow::bail!("The {} path must start with '/': {}", name, path);
            }
        }
        if self.tunnel_path == self.health_path {
            anyhow::bail!("Tunnel and health paths must differ");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("Request timeout must be greater than zero");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("Max body size must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let config = RelayConfig::try_parse_from([
            "webexpose-relay",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--tunnel-path",
            "/agent",
            "--request-timeout-ms",
            "250",
            "-v",
        ])
        .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.tunnel_path, "/agent");
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert!(config.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert_eq!(config.tunnel_path, "/WSconnect");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let bad_path = RelayConfig {
            tunnel_path: "WSconnect".into(),
            ..Default::default()
        };
        assert!(bad_path.validate().is_err());

        let same_paths = RelayConfig {
            health_path: DEFAULT_TUNNEL_PATH.into(),
            ..Default::default()
        };
        assert!(same_paths.validate().is_err());

        let zero_timeout = RelayConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());
    }
}
