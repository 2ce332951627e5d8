//! Per-service registry of outbound clients.

use crate::client::OutboundClient;
use crate::naming::Service;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Concurrent service id -> client map for one logical service.
///
/// Ids being connected are tracked separately so that a discovery event
/// arriving while a client is still dialing does not start a second one.
pub struct ClientPool {
    name: String,
    clients: DashMap<String, Arc<OutboundClient>>,
    pending: DashSet<String>,
}

impl ClientPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: DashMap::new(),
            pending: DashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a client. Empty ids are rejected; an id already present is
    /// left untouched. Returns whether the client was inserted.
    pub fn add(&self, client: Arc<OutboundClient>) -> bool {
        let id = client.id().to_string();
        if id.is_empty() {
            warn!("Pool {}: refusing client with empty id", self.name);
            return false;
        }
        let inserted = match self.clients.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        };
        self.pending.remove(&id);
        if inserted {
            debug!("Pool {}: added {}", self.name, id);
        }
        inserted
    }

    pub fn remove(&self, id: &str) -> Option<Arc<OutboundClient>> {
        let removed = self.clients.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            debug!("Pool {}: removed {}", self.name, id);
        }
        removed
    }

    /// Remove `client` only if it is still the entry registered for its id.
    pub fn remove_client(&self, client: &Arc<OutboundClient>) -> bool {
        self.clients
            .remove_if(client.id(), |_, current| Arc::ptr_eq(current, client))
            .is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<OutboundClient>> {
        self.clients.get(id).map(|c| c.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Claim `id` for connecting. False when it is already present or
    /// another caller is already connecting it.
    pub fn reserve(&self, id: &str) -> bool {
        if id.is_empty() || self.clients.contains_key(id) {
            return false;
        }
        self.pending.insert(id.to_string())
    }

    /// Give up a claim taken with [`ClientPool::reserve`].
    pub fn release(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Members whose metadata matches `filter`, or every member when no
    /// filter is given. Sorted by id.
    pub fn services(&self, filter: Option<(&str, &str)>) -> Vec<Arc<dyn Service>> {
        let mut members: Vec<Arc<OutboundClient>> = self
            .clients
            .iter()
            .filter(|c| match filter {
                Some((key, value)) => c.meta().matches(key, value),
                None => true,
            })
            .map(|c| c.value().clone())
            .collect();
        members.sort_by(|a, b| a.id().cmp(b.id()));
        members
            .into_iter()
            .map(|c| c as Arc<dyn Service>)
            .collect()
    }

    /// Every client, for shutdown.
    pub fn clients(&self) -> Vec<Arc<OutboundClient>> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::dialer::PlainTcpDialer;
    use crate::naming::{ServiceMeta, KEY_SERVICE_STATE, STATE_ADULT, STATE_YOUNG};

    fn client(id: &str, state: &str) -> Arc<OutboundClient> {
        let meta = ServiceMeta::default();
        meta.set(KEY_SERVICE_STATE, state);
        Arc::new(OutboundClient::new(
            id,
            "chat",
            Arc::new(meta),
            ClientOptions::default(),
            Arc::new(PlainTcpDialer),
        ))
    }

    fn ids(services: &[Arc<dyn Service>]) -> Vec<&str> {
        services.iter().map(|s| s.service_id()).collect()
    }

    #[test]
    fn test_add_is_idempotent_and_rejects_empty_id() {
        let pool = ClientPool::new("chat");
        let first = client("c1", STATE_ADULT);
        assert!(pool.add(first.clone()));
        assert!(!pool.add(client("c1", STATE_YOUNG)));
        assert!(Arc::ptr_eq(&pool.get("c1").unwrap(), &first));
        assert!(!pool.add(client("", STATE_ADULT)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_services_filter_and_order() {
        let pool = ClientPool::new("chat");
        pool.add(client("c3", STATE_ADULT));
        pool.add(client("c1", STATE_ADULT));
        pool.add(client("c2", STATE_YOUNG));

        assert_eq!(ids(&pool.services(None)), vec!["c1", "c2", "c3"]);
        assert_eq!(
            ids(&pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT)))),
            vec!["c1", "c3"]
        );

        pool.get("c2").unwrap().meta().set(KEY_SERVICE_STATE, STATE_ADULT);
        assert_eq!(
            pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT))).len(),
            3
        );
    }

    #[test]
    fn test_reserve_release_and_remove() {
        let pool = ClientPool::new("chat");
        assert!(pool.reserve("c1"));
        assert!(!pool.reserve("c1"));
        pool.release("c1");
        assert!(pool.reserve("c1"));
        pool.add(client("c1", STATE_ADULT));
        assert!(!pool.reserve("c1"));

        let stale = client("c1", STATE_ADULT);
        assert!(!pool.remove_client(&stale));
        assert!(pool.remove("c1").is_some());
        assert!(pool.remove("c1").is_none());
        assert!(pool.reserve("c1"));
    }
}
