//! Pluggable dial-and-handshake strategy for outbound clients.

use crate::connection::{boxed, BoxedStream};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// What a dialer knows about the peer it is connecting to.
#[derive(Debug, Clone)]
pub struct DialerContext {
    /// Service id of the peer.
    pub id: String,
    /// Service name of the peer.
    pub name: String,
    pub address: String,
    /// Budget for dial plus handshake.
    pub timeout: Duration,
}

/// Establishes a raw connection to a peer and runs whatever handshake the
/// deployment needs before normal traffic.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<BoxedStream>;
}

/// Connect to `address` over TCP within `wait`.
pub async fn dial_tcp(address: &str, wait: Duration) -> Result<TcpStream> {
    let stream = timeout(wait, TcpStream::connect(address))
        .await
        .map_err(|_| MeshError::Timeout("dial"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dialer that connects over TCP and sends nothing before traffic.
pub struct PlainTcpDialer;

#[async_trait]
impl Dialer for PlainTcpDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<BoxedStream> {
        Ok(boxed(dial_tcp(&ctx.address, ctx.timeout).await?))
    }
}
