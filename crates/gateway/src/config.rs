//! Gateway configuration, read from the environment.

use crate::error::{GatewayError, Result};
use mesh::{ServerOptions, ServiceInstance};
use naming::KEY_HEALTH_URL;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use wire::Protocol;

#[derive(Debug, Clone)]
pub struct Config {
    pub service_id: String,
    pub service_name: String,
    /// Address the user-facing listener binds.
    pub listen: String,
    /// Address registered with naming.
    pub public_address: String,
    pub public_port: u16,
    /// `ws` for browsers and apps, `tcp` for native clients.
    pub protocol: Protocol,
    pub consul_url: String,
    pub tags: Vec<String>,
    pub metrics_port: u16,
    pub health_port: u16,
    /// Idle timeout of a user connection.
    pub read_wait: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        Ok(Self {
            service_id: var("SERVICE_ID", "gateway01"),
            service_name: var("SERVICE_NAME", "wgateway"),
            listen: var("LISTEN", "0.0.0.0:8000"),
            public_address: var("PUBLIC_ADDRESS", "127.0.0.1"),
            public_port: parse("PUBLIC_PORT", &var("PUBLIC_PORT", "8000"))?,
            protocol: parse("PROTOCOL", &var("PROTOCOL", "ws"))?,
            consul_url: var("CONSUL_URL", "http://localhost:8500"),
            tags: split_tags(&var("TAGS", "")),
            metrics_port: parse("METRICS_PORT", &var("METRICS_PORT", "9094"))?,
            health_port: parse("HEALTH_PORT", &var("HEALTH_PORT", "8001"))?,
            read_wait: Duration::from_secs(parse("READ_WAIT_SECS", &var("READ_WAIT_SECS", "120"))?),
        })
    }

    /// Registration record, with the health endpoint Consul should poll.
    pub fn instance(&self) -> ServiceInstance {
        ServiceInstance::new(&self.service_id, &self.service_name, self.protocol)
            .with_address(&self.public_address, self.public_port)
            .with_tags(self.tags.clone())
            .with_meta(
                KEY_HEALTH_URL,
                format!("http://{}:{}/health", self.public_address, self.health_port),
            )
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            read_wait: self.read_wait,
            ..Default::default()
        }
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("  SERVICE_ID: {}", self.service_id);
        info!("  SERVICE_NAME: {}", self.service_name);
        info!("  LISTEN: {} ({})", self.listen, self.protocol);
        info!("  PUBLIC: {}:{}", self.public_address, self.public_port);
        info!("  CONSUL_URL: {}", self.consul_url);
        info!("  TAGS: {:?}", self.tags);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  HEALTH_PORT: {}", self.health_port);
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| GatewayError::Config(format!("{} must be valid: {}", key, e)))
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
