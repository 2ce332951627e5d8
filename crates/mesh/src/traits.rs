//! Trait seams between the transport server, channels and services.

use crate::connection::FramedConnection;
use crate::error::Result;
use crate::naming::ServiceInstance;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Anything payloads can be pushed to by id.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn push(&self, payload: Bytes) -> Result<()>;
}

/// Decides whether a freshly accepted connection may become a channel.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Run the handshake within `login_wait` and return the channel id.
    /// Any error rejects the connection.
    async fn accept(&self, conn: &mut FramedConnection, login_wait: Duration) -> Result<String>;
}

/// Receives every non-empty binary payload read from a channel.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes);
}

/// Notified once a channel has gone away.
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn disconnect(&self, id: &str) -> Result<()>;
}

/// The transport server a container owns.
#[async_trait]
pub trait Server: Send + Sync {
    /// Registration record of this server.
    fn instance(&self) -> &ServiceInstance;

    /// Run the accept loop until shutdown.
    async fn start(&self) -> Result<()>;

    /// Push a payload to the channel with the given id.
    async fn push(&self, id: &str, payload: Bytes) -> Result<()>;

    /// Stop accepting and close every channel, waiting at most `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}
