//! Logic service configuration, read from the environment.

use crate::error::{LogicError, Result};
use mesh::ServiceInstance;
use std::env;
use tracing::info;
use wire::protocol::{SN_CHAT, SN_LOGIN};
use wire::Protocol;

#[derive(Debug, Clone)]
pub struct Config {
    pub service_id: String,
    /// `login` or `chat`; selects the handlers this process serves.
    pub service_name: String,
    pub listen: String,
    pub public_address: String,
    pub public_port: u16,
    pub consul_url: String,
    pub redis_url: String,
    pub tags: Vec<String>,
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let port = |key: &str, default: &str| -> Result<u16> {
            var(key, default)
                .parse()
                .map_err(|e| LogicError::Config(format!("{} must be a port: {}", key, e)))
        };

        let service_name = var("SERVICE_NAME", SN_LOGIN);
        if service_name != SN_LOGIN && service_name != SN_CHAT {
            return Err(LogicError::Config(format!(
                "SERVICE_NAME must be {} or {}, got {}",
                SN_LOGIN, SN_CHAT, service_name
            )));
        }
        Ok(Self {
            service_id: var("SERVICE_ID", &format!("{}01", service_name)),
            listen: var("LISTEN", "0.0.0.0:8100"),
            public_address: var("PUBLIC_ADDRESS", "127.0.0.1"),
            public_port: port("PUBLIC_PORT", "8100")?,
            consul_url: var("CONSUL_URL", "http://localhost:8500"),
            redis_url: var("REDIS_URL", "redis://localhost:6379"),
            tags: var("TAGS", "")
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            metrics_port: port("METRICS_PORT", "9095")?,
            service_name,
        })
    }

    /// Logic services only speak TCP to gateways.
    pub fn instance(&self) -> ServiceInstance {
        ServiceInstance::new(&self.service_id, &self.service_name, Protocol::Tcp)
            .with_address(&self.public_address, self.public_port)
            .with_tags(self.tags.clone())
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("  SERVICE_ID: {}", self.service_id);
        info!("  SERVICE_NAME: {}", self.service_name);
        info!("  LISTEN: {}", self.listen);
        info!("  PUBLIC: {}:{}", self.public_address, self.public_port);
        info!("  CONSUL_URL: {}", self.consul_url);
        info!("  REDIS_URL: {}", self.redis_url);
        info!("  METRICS_PORT: {}", self.metrics_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_selects_defaults() {
        let config = Config::from_lookup(|k| (k == "SERVICE_NAME").then(|| "chat".to_string()))
            .unwrap();
        assert_eq!(config.service_id, "chat01");
        assert_eq!(config.instance().protocol, Protocol::Tcp);
        assert_eq!(config.instance().dial_url(), "127.0.0.1:8100");
    }

    #[test]
    fn test_unknown_service_name_is_rejected() {
        let err = Config::from_lookup(|k| (k == "SERVICE_NAME").then(|| "group".to_string()))
            .unwrap_err();
        assert!(matches!(err, LogicError::Config(_)));
    }
}
