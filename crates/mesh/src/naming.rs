//! Service discovery interface and an in-process registry.

use crate::error::{MeshError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use wire::Protocol;

/// Local-only metadata key holding an instance's routing state.
pub const KEY_SERVICE_STATE: &str = "service_state";
/// Newly discovered, still inside its warm-up window.
pub const STATE_YOUNG: &str = "young";
/// Routable.
pub const STATE_ADULT: &str = "adult";

/// Snapshot of one registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    /// Publicly reachable host. Empty when the instance is not registered.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: String::new(),
            port: 0,
            protocol,
            namespace: String::new(),
            tags: Vec::new(),
            meta: HashMap::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// True when the instance advertises an address peers can dial.
    pub fn is_public(&self) -> bool {
        !self.address.is_empty()
    }

    /// Address to dial: `host:port` for TCP, a `ws://` URL for WebSocket.
    pub fn dial_url(&self) -> String {
        match self.protocol {
            Protocol::Tcp => format!("{}:{}", self.address, self.port),
            Protocol::Websocket => format!("ws://{}:{}", self.address, self.port),
        }
    }
}

/// Metadata of one discovered instance, shared between the container's
/// promotion timer and the client built for the instance.
#[derive(Debug, Default)]
pub struct ServiceMeta {
    entries: RwLock<HashMap<String, String>>,
}

impl ServiceMeta {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|v| v == value)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Read-only view of a routable service member.
pub trait Service: Send + Sync {
    fn service_id(&self) -> &str;
    fn service_name(&self) -> &str;
    fn get_meta(&self, key: &str) -> Option<String>;
}

/// Called with the full current membership of a service on every change.
pub type ServiceCallback = Arc<dyn Fn(Vec<ServiceInstance>) + Send + Sync>;

/// Service discovery backend.
#[async_trait]
pub trait Naming: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    async fn deregister(&self, id: &str) -> Result<()>;

    /// Current members of `name`. When `tags` is non-empty only members
    /// carrying every tag are returned.
    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceInstance>>;

    /// Watch `name`. Subscribing twice to the same name is an error.
    async fn subscribe(&self, name: &str, callback: ServiceCallback) -> Result<()>;

    /// Stop watching `name`. Updates arriving afterwards are discarded.
    async fn unsubscribe(&self, name: &str) -> Result<()>;
}

/// In-process registry. Registering or deregistering an instance notifies
/// the subscriber of that service with its full membership.
#[derive(Default)]
pub struct MemoryNaming {
    services: RwLock<HashMap<String, BTreeMap<String, ServiceInstance>>>,
    subscribers: RwLock<HashMap<String, ServiceCallback>>,
}

impl MemoryNaming {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self, name: &str) -> Vec<ServiceInstance> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self, name: &str) {
        let callback = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some(callback) = callback {
            let members = self.members(name);
            debug!("Notifying subscriber of {} with {} members", name, members.len());
            callback(members);
        }
    }
}

#[async_trait]
impl Naming for MemoryNaming {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance.name.clone())
            .or_default()
            .insert(instance.id.clone(), instance.clone());
        info!("Registered {} ({})", instance.id, instance.name);
        self.notify(&instance.name);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let name = {
            let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
            services
                .iter_mut()
                .find_map(|(name, members)| members.remove(id).map(|_| name.clone()))
        };
        match name {
            Some(name) => {
                info!("Deregistered {} ({})", id, name);
                self.notify(&name);
            }
            None => debug!("Deregister of unknown instance {}", id),
        }
        Ok(())
    }

    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .members(name)
            .into_iter()
            .filter(|s| tags.iter().all(|t| s.tags.contains(t)))
            .collect())
    }

    async fn subscribe(&self, name: &str, callback: ServiceCallback) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.contains_key(name) {
            return Err(MeshError::Naming(format!("{} already subscribed", name)));
        }
        subscribers.insert(name.to_string(), callback);
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}
