//! Consul `Naming` implementation.
//!
//! Registration goes through the local agent API; lookups use the health
//! endpoint so only instances with passing checks are returned. A
//! subscription is a background task running Consul blocking queries:
//!
//! ```text
//! GET /v1/health/service/{name}?passing=true              -> X-Consul-Index: 7
//! GET /v1/health/service/{name}?passing=true&index=7&wait=300s
//!     ... blocks until membership changes or wait elapses ...
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use mesh::{Naming, ServiceCallback, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wire::Protocol;

/// Meta key carrying the instance's transport (`tcp` or `ws`).
pub const KEY_PROTOCOL: &str = "protocol";

/// Meta key naming an HTTP URL Consul should health check.
pub const KEY_HEALTH_URL: &str = "health_url";

const INDEX_HEADER: &str = "X-Consul-Index";

/// Default blocking query wait.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<Check>,
}

#[derive(Debug, Serialize)]
struct Check {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Timeout")]
    timeout: &'static str,
    #[serde(rename = "Interval")]
    interval: &'static str,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: &'static str,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    name: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

impl AgentService {
    fn into_instance(self) -> Option<ServiceInstance> {
        let meta = self.meta.unwrap_or_default();
        let protocol = match meta.get(KEY_PROTOCOL).map(|p| p.parse::<Protocol>()) {
            Some(Ok(protocol)) => protocol,
            Some(Err(e)) => {
                warn!("Skipping {}: {}", self.id, e);
                return None;
            }
            None => {
                warn!("Skipping {}: no {} meta", self.id, KEY_PROTOCOL);
                return None;
            }
        };
        let mut instance = ServiceInstance::new(self.id, self.name, protocol)
            .with_address(self.address, self.port)
            .with_tags(self.tags.unwrap_or_default());
        instance.meta = meta;
        Some(instance)
    }
}

/// Thin HTTP client over the Consul endpoints the naming layer needs.
#[derive(Debug, Clone)]
struct ConsulApi {
    http: reqwest::Client,
    base_url: String,
    wait: Duration,
}

impl ConsulApi {
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(Error::Api {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let mut meta = instance.meta.clone();
        meta.insert(KEY_PROTOCOL.to_string(), instance.protocol.to_string());
        let check = meta.get(KEY_HEALTH_URL).filter(|u| !u.is_empty()).map(|url| Check {
            check_id: format!("{}_normal", instance.id),
            http: url.clone(),
            timeout: "1s",
            interval: "10s",
            deregister_after: "20s",
        });
        let body = Registration {
            id: &instance.id,
            name: &instance.name,
            address: &instance.address,
            port: instance.port,
            tags: &instance.tags,
            meta,
            check,
        };
        let url = format!("{}/v1/agent/service/register", self.base_url);
        debug!("Registering {} at {}", instance.id, url);
        Self::check(self.http.put(&url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        Self::check(self.http.put(&url).send().await?).await?;
        Ok(())
    }

    /// Passing members of `name` and the index to block on next. With a
    /// non-zero `index` the call blocks until the index moves or `wait`
    /// elapses.
    async fn load(&self, name: &str, tags: &[String], index: u64) -> Result<(Vec<ServiceInstance>, u64)> {
        let url = format!("{}/v1/health/service/{}", self.base_url, name);
        let mut request = self.http.get(&url).query(&[("passing", "true")]);
        for tag in tags {
            request = request.query(&[("tag", tag)]);
        }
        if index > 0 {
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.wait.as_secs())),
                ])
                // Consul adds up to wait/16 of jitter.
                .timeout(self.wait + self.wait / 16 + Duration::from_secs(5));
        }
        let response = Self::check(request.send().await?).await?;
        let next = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidResponse(format!("missing {} header", INDEX_HEADER)))?;
        let entries: Vec<HealthEntry> = response.json().await?;
        let services = entries
            .into_iter()
            .filter_map(|e| e.service.into_instance())
            .collect::<Vec<_>>();
        debug!("Loaded {} instances of {} at index {}", services.len(), name, next);
        Ok((services, next))
    }
}

/// `Naming` over a Consul agent.
pub struct ConsulNaming {
    api: ConsulApi,
    watches: Mutex<HashMap<String, CancellationToken>>,
    tasks: TaskTracker,
}

impl ConsulNaming {
    /// Client for the agent at `base_url`, e.g. `http://localhost:8500`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api: ConsulApi {
                http: reqwest::Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                wait: DEFAULT_WAIT,
            },
            watches: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Override the blocking query wait.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.api.wait = wait;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.api.base_url
    }

    /// Stop every watch and wait for the watch tasks to exit.
    pub async fn close(&self) {
        let watches: Vec<CancellationToken> = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in watches {
            token.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn watch(api: ConsulApi, name: String, callback: ServiceCallback, quit: CancellationToken) {
    let mut index = 0;
    let mut primed = false;
    loop {
        let result = tokio::select! {
            _ = quit.cancelled() => break,
            r = api.load(&name, &[], index) => r,
        };
        // An update racing with unsubscribe is dropped here.
        if quit.is_cancelled() {
            break;
        }
        match result {
            Ok((services, next)) => {
                if primed && next != index {
                    debug!("{} membership changed, {} passing", name, services.len());
                    callback(services);
                }
                // Index went backwards: Consul restarted or the index was reset.
                index = if next < index { 0 } else { next };
                primed = true;
            }
            Err(e) => {
                warn!("Watch {} query failed: {}", name, e);
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("Watch {} stopped", name);
}

#[async_trait]
impl Naming for ConsulNaming {
    async fn register(&self, instance: &ServiceInstance) -> mesh::Result<()> {
        self.api.register(instance).await?;
        info!("Registered {} ({}) with Consul", instance.id, instance.name);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> mesh::Result<()> {
        self.api.deregister(id).await?;
        info!("Deregistered {} from Consul", id);
        Ok(())
    }

    async fn find(&self, name: &str, tags: &[String]) -> mesh::Result<Vec<ServiceInstance>> {
        let (services, _) = self.api.load(name, tags, 0).await?;
        Ok(services)
    }

    async fn subscribe(&self, name: &str, callback: ServiceCallback) -> mesh::Result<()> {
        let quit = {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            if watches.contains_key(name) {
                return Err(Error::AlreadySubscribed(name.to_string()).into());
            }
            let quit = CancellationToken::new();
            watches.insert(name.to_string(), quit.clone());
            quit
        };
        info!("Watching {}", name);
        self.tasks
            .spawn(watch(self.api.clone(), name.to_string(), callback, quit));
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> mesh::Result<()> {
        let token = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }
}
