//! Redis session storage.

use crate::error::Result;
use async_trait::async_trait;
use mesh::{MeshError, SessionStorage};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};
use wire::{Location, Session};

/// Session key prefix: login:sn:{channel_id}
pub const SESSION_KEY_PREFIX: &str = "login:sn:";

/// Location key prefix: login:loc:{account}
pub const LOCATION_KEY_PREFIX: &str = "login:loc:";

/// Expiry of both keys (48 hours).
pub const SESSION_TTL_SECS: u64 = 48 * 60 * 60;

/// Deletes `KEYS[2]` (session) and `KEYS[1]` (location) when the stored
/// location still names channel `ARGV[1]`. The location value starts with a
/// u16 big-endian length followed by the channel id.
const DELETE_SESSION_SCRIPT: &str = r#"
local loc = redis.call('GET', KEYS[1])
local removed = 0
if loc and #loc >= 2 then
  local n = string.byte(loc, 1) * 256 + string.byte(loc, 2)
  if string.sub(loc, 3, 2 + n) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    removed = 1
  end
end
redis.call('DEL', KEYS[2])
return removed
"#;

fn session_key(channel_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, channel_id)
}

fn location_key(account: &str) -> String {
    format!("{}{}", LOCATION_KEY_PREFIX, account)
}

/// Decode an MGET reply, skipping accounts with no location.
fn decode_locations(values: Vec<Option<Vec<u8>>>) -> Result<Vec<Location>> {
    values
        .into_iter()
        .flatten()
        .map(|raw| Location::from_bytes(&raw).map_err(Into::into))
        .collect()
}

/// `SessionStorage` over a shared multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStorage {
    conn: MultiplexedConnection,
}

impl RedisStorage {
    /// Connect to `redis_url`, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    async fn add_session(&self, session: &Session) -> Result<()> {
        let mut conn = self.conn.clone();
        let location = Location::new(session.channel_id.clone(), session.gate_id.clone());
        let json = serde_json::to_string(session)?;

        redis::pipe()
            .atomic()
            .set_ex(location_key(&session.account), location.to_bytes()?, SESSION_TTL_SECS)
            .ignore()
            .set_ex(session_key(&session.channel_id), json, SESSION_TTL_SECS)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(
            "Stored session {} for {} on {}",
            session.channel_id, session.account, session.gate_id
        );
        Ok(())
    }

    async fn delete_session(&self, account: &str, channel_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(DELETE_SESSION_SCRIPT)
            .key(location_key(account))
            .key(session_key(channel_id))
            .arg(channel_id)
            .invoke_async(&mut conn)
            .await?;
        debug!(
            "Deleted session {} for {} (location {})",
            channel_id,
            account,
            if removed == 1 { "removed" } else { "kept" }
        );
        Ok(())
    }

    async fn load_session(&self, channel_id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(session_key(channel_id)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn load_location(&self, account: &str) -> Result<Option<Location>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(location_key(account)).await?;
        match raw {
            Some(raw) => Ok(Some(Location::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_locations(&self, accounts: &[String]) -> Result<Vec<Location>> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = accounts.iter().map(|a| location_key(a)).collect();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        decode_locations(values)
    }
}

#[async_trait]
impl SessionStorage for RedisStorage {
    async fn add(&self, session: &Session) -> mesh::Result<()> {
        Ok(self.add_session(session).await?)
    }

    async fn delete(&self, account: &str, channel_id: &str) -> mesh::Result<()> {
        Ok(self.delete_session(account, channel_id).await?)
    }

    async fn get(&self, channel_id: &str) -> mesh::Result<Session> {
        self.load_session(channel_id)
            .await?
            .ok_or_else(|| MeshError::SessionNotFound(channel_id.to_string()))
    }

    async fn get_location(&self, account: &str) -> mesh::Result<Location> {
        self.load_location(account)
            .await?
            .ok_or_else(|| MeshError::SessionNotFound(account.to_string()))
    }

    async fn get_locations(&self, accounts: &[String]) -> mesh::Result<Vec<Location>> {
        Ok(self.load_locations(accounts).await?)
    }
}
