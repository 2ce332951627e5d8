//! Session storage interface and an in-memory implementation.

use crate::error::{MeshError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use wire::{Location, Session};

/// Where live sessions and account locations are kept.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Store a session and point its account's location at it.
    async fn add(&self, session: &Session) -> Result<()>;

    /// Drop the channel's session. The account's location is dropped only
    /// while it still points at `channel_id`.
    async fn delete(&self, account: &str, channel_id: &str) -> Result<()>;

    /// Session for a channel, or `SessionNotFound`.
    async fn get(&self, channel_id: &str) -> Result<Session>;

    /// Location of an account, or `SessionNotFound`.
    async fn get_location(&self, account: &str) -> Result<Location>;

    /// Locations of every account that has one; missing accounts are skipped.
    async fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>>;
}

/// In-memory session storage.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: DashMap<String, Session>,
    locations: DashMap<String, Location>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn add(&self, session: &Session) -> Result<()> {
        self.locations.insert(
            session.account.clone(),
            Location::new(session.channel_id.clone(), session.gate_id.clone()),
        );
        self.sessions
            .insert(session.channel_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, account: &str, channel_id: &str) -> Result<()> {
        self.locations
            .remove_if(account, |_, loc| loc.channel_id == channel_id);
        self.sessions.remove(channel_id);
        Ok(())
    }

    async fn get(&self, channel_id: &str) -> Result<Session> {
        self.sessions
            .get(channel_id)
            .map(|s| s.clone())
            .ok_or_else(|| MeshError::SessionNotFound(channel_id.to_string()))
    }

    async fn get_location(&self, account: &str) -> Result<Location> {
        self.locations
            .get(account)
            .map(|l| l.clone())
            .ok_or_else(|| MeshError::SessionNotFound(account.to_string()))
    }

    async fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>> {
        Ok(accounts
            .iter()
            .filter_map(|a| self.locations.get(a).map(|l| l.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(account: &str, channel: &str) -> Session {
        Session {
            channel_id: channel.into(),
            gate_id: "gw-1".into(),
            account: account.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let store = MemoryStorage::new();
        store.add(&session("alice", "c1")).await.unwrap();

        assert_eq!(store.get("c1").await.unwrap().account, "alice");
        assert_eq!(
            store.get_location("alice").await.unwrap(),
            Location::new("c1", "gw-1")
        );

        store.delete("alice", "c1").await.unwrap();
        assert!(matches!(
            store.get("c1").await,
            Err(MeshError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.get_location("alice").await,
            Err(MeshError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_old_channel_keeps_newer_location() {
        let store = MemoryStorage::new();
        store.add(&session("alice", "c1")).await.unwrap();
        store.add(&session("alice", "c2")).await.unwrap();

        store.delete("alice", "c1").await.unwrap();
        assert!(store.get("c1").await.is_err());
        assert_eq!(store.get_location("alice").await.unwrap().channel_id, "c2");
        assert_eq!(store.get("c2").await.unwrap().account, "alice");
    }

    #[tokio::test]
    async fn test_get_locations_skips_missing() {
        let store = MemoryStorage::new();
        store.add(&session("alice", "c1")).await.unwrap();
        store.add(&session("bob", "c2")).await.unwrap();

        let locs = store
            .get_locations(&["alice".into(), "carol".into(), "bob".into()])
            .await
            .unwrap();
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[1].channel_id, "c2");
    }
}
