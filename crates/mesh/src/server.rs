//! Accepting side of the mesh.
//!
//! `MeshServer` accepts TCP connections, frames each one as TCP or
//! WebSocket according to its registration, runs the acceptor handshake and
//! turns the connection into a [`Channel`] tracked in a [`ChannelMap`].

use crate::channel::Channel;
use crate::config::ServerOptions;
use crate::connection::{boxed, FramedConnection};
use crate::error::{MeshError, Result};
use crate::frame::OpCode;
use crate::naming::ServiceInstance;
use crate::traits::{Acceptor, MessageListener, Server, StateListener};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire::Protocol;

/// Concurrent id -> channel map.
#[derive(Default)]
pub struct ChannelMap {
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel. Fails if the id is taken.
    pub fn add(&self, channel: Arc<Channel>) -> Result<()> {
        match self.channels.entry(channel.id().to_string()) {
            Entry::Occupied(_) => Err(MeshError::DuplicateChannel(channel.id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(channel);
                Ok(())
            }
        }
    }

    /// Remove `channel` if it is still the one registered under its id.
    pub fn remove(&self, channel: &Arc<Channel>) {
        self.channels
            .remove_if(channel.id(), |_, current| Arc::ptr_eq(current, channel));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|c| c.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Acceptor that skips the handshake and assigns a random id.
pub struct DefaultAcceptor;

#[async_trait]
impl Acceptor for DefaultAcceptor {
    async fn accept(&self, _conn: &mut FramedConnection, _login_wait: Duration) -> Result<String> {
        Ok(Uuid::new_v4().to_string())
    }
}

/// State listener that only logs.
pub struct LogStateListener;

#[async_trait]
impl StateListener for LogStateListener {
    async fn disconnect(&self, id: &str) -> Result<()> {
        debug!("Channel {} disconnected", id);
        Ok(())
    }
}

/// Builder for [`MeshServer`].
pub struct MeshServerBuilder {
    listen: String,
    instance: ServiceInstance,
    options: ServerOptions,
    acceptor: Arc<dyn Acceptor>,
    message_listener: Arc<dyn MessageListener>,
    state_listener: Arc<dyn StateListener>,
}

impl MeshServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.state_listener = listener;
        self
    }

    pub fn build(self) -> MeshServer {
        MeshServer {
            inner: Arc::new(ServerInner {
                listen: self.listen,
                instance: self.instance,
                options: self.options,
                acceptor: self.acceptor,
                message_listener: self.message_listener,
                state_listener: self.state_listener,
                channels: ChannelMap::new(),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

struct ServerInner {
    listen: String,
    instance: ServiceInstance,
    options: ServerOptions,
    acceptor: Arc<dyn Acceptor>,
    message_listener: Arc<dyn MessageListener>,
    state_listener: Arc<dyn StateListener>,
    channels: ChannelMap,
    tasks: TaskTracker,
    cancel: CancellationToken,
    shutdown: AtomicBool,
}

/// TCP or WebSocket server owning the channels of one service instance.
#[derive(Clone)]
pub struct MeshServer {
    inner: Arc<ServerInner>,
}

impl MeshServer {
    /// Start building a server that listens on `listen` and hands inbound
    /// payloads to `listener`.
    pub fn builder(
        listen: impl Into<String>,
        instance: ServiceInstance,
        listener: Arc<dyn MessageListener>,
    ) -> MeshServerBuilder {
        MeshServerBuilder {
            listen: listen.into(),
            instance,
            options: ServerOptions::default(),
            acceptor: Arc::new(DefaultAcceptor),
            message_listener: listener,
            state_listener: Arc::new(LogStateListener),
        }
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.inner.channels
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Accept on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let inner = &self.inner;
        info!(
            "{} ({}) listening on {} [{}]",
            inner.instance.id,
            inner.instance.name,
            listener.local_addr()?,
            inner.instance.protocol
        );

        loop {
            let (stream, addr) = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            counter!("mesh_connections_accepted_total").increment(1);
            let inner = self.inner.clone();
            self.inner
                .tasks
                .spawn(async move { inner.handle_connection(stream, addr).await });
        }

        info!("{} stopped accepting", inner.instance.id);
        Ok(())
    }
}

impl ServerInner {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let max = self.options.max_frame_size;
        let conn = match self.instance.protocol {
            Protocol::Tcp => Ok(FramedConnection::tcp(boxed(stream), max)),
            Protocol::Websocket => {
                match timeout(
                    self.options.login_wait,
                    FramedConnection::accept_websocket(boxed(stream), max),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::Timeout("websocket upgrade")),
                }
            }
        };
        let mut conn = match conn {
            Ok(conn) => conn.with_peer_addr(addr),
            Err(e) => {
                warn!("Upgrade from {} failed: {}", addr, e);
                return;
            }
        };

        let id = match self.acceptor.accept(&mut conn, self.options.login_wait).await {
            Ok(id) => id,
            Err(e) => {
                reject(&mut conn, &e).await;
                return;
            }
        };
        if self.channels.contains(&id) {
            reject(&mut conn, &MeshError::DuplicateChannel(id)).await;
            return;
        }

        let channel = Channel::new(id.clone(), conn, &self.options, &self.tasks);
        if let Err(e) = self.channels.add(channel.clone()) {
            warn!("{}", e);
            channel.close();
            return;
        }
        gauge!("mesh_channels_active").increment(1.0);
        info!("Channel {} accepted from {}", id, addr);
        if self.cancel.is_cancelled() {
            channel.close();
        }

        let result = channel.readloop(self.message_listener.clone()).await;
        match &result {
            Err(MeshError::RemoteClosed) | Err(MeshError::ChannelClosed(_)) => {
                debug!("Channel {} readloop ended: {:?}", id, result)
            }
            Err(e) => info!("Channel {} readloop ended: {}", id, e),
            Ok(()) => {}
        }

        self.channels.remove(&channel);
        gauge!("mesh_channels_active").decrement(1.0);
        counter!("mesh_connections_closed_total").increment(1);
        if let Err(e) = self.state_listener.disconnect(&id).await {
            warn!("Disconnect callback for {} failed: {}", id, e);
        }
        channel.close();
    }
}

async fn reject(conn: &mut FramedConnection, reason: &MeshError) {
    info!("Rejecting connection from {:?}: {}", conn.peer_addr(), reason);
    let _ = conn
        .write_frame(OpCode::Close, reason.to_string().as_bytes())
        .await;
    let _ = conn.flush().await;
    let _ = conn.close().await;
}

#[async_trait]
impl Server for MeshServer {
    fn instance(&self) -> &ServiceInstance {
        &self.inner.instance
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.inner.listen).await?;
        self.serve(listener).await
    }

    async fn push(&self, id: &str, payload: Bytes) -> Result<()> {
        let channel = self
            .inner
            .channels
            .get(id)
            .ok_or_else(|| MeshError::ChannelNotFound(id.to_string()))?;
        channel.push(payload).await
    }

    async fn shutdown(&self, wait: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return Err(MeshError::AlreadyClosed);
        }
        info!("Shutting down {}", inner.instance.id);
        inner.cancel.cancel();

        let channels = inner.channels.all();
        for channel in &channels {
            channel.close();
        }
        inner.tasks.close();
        match timeout(wait, inner.tasks.wait()).await {
            Ok(()) => {
                info!("{} closed {} channels", inner.instance.id, channels.len());
                Ok(())
            }
            Err(_) => {
                error!("{} shutdown timed out", inner.instance.id);
                Err(MeshError::ShutdownTimeout(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
    use crate::traits::Agent;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl MessageListener for Echo {
        async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
            let _ = agent.push(payload).await;
        }
    }

    struct FixedId(&'static str);

    #[async_trait]
    impl Acceptor for FixedId {
        async fn accept(&self, conn: &mut FramedConnection, login_wait: Duration) -> Result<String> {
            let frame = timeout(login_wait, conn.read_frame())
                .await
                .map_err(|_| MeshError::Timeout("login"))??;
            if frame.payload.as_ref() != b"let me in" {
                return Err(MeshError::Handshake("bad token".into()));
            }
            Ok(self.0.to_string())
        }
    }

    struct Disconnects(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl StateListener for Disconnects {
        async fn disconnect(&self, id: &str) -> Result<()> {
            let _ = self.0.send(id.to_string());
            Ok(())
        }
    }

    async fn start_server(
        acceptor: Arc<dyn Acceptor>,
    ) -> (MeshServer, SocketAddr, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = MeshServer::builder(
            "127.0.0.1:0",
            ServiceInstance::new("srv-1", "chat", Protocol::Tcp),
            Arc::new(Echo),
        )
        .acceptor(acceptor)
        .state_listener(Arc::new(Disconnects(tx)))
        .build();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.serve(listener).await });
        (server, addr, rx)
    }

    async fn wait_for_channels(server: &MeshServer, n: usize) {
        for _ in 0..100 {
            if server.channel_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} channels, have {}", n, server.channel_count());
    }

    #[tokio::test]
    async fn test_accept_echo_and_disconnect() {
        let (server, addr, mut disconnects) = start_server(Arc::new(FixedId("c1"))).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, OpCode::Binary, b"let me in", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        wait_for_channels(&server, 1).await;

        write_frame(&mut stream, OpCode::Binary, b"ping?", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let echo = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(echo.payload.as_ref(), b"ping?");

        server.push("c1", Bytes::from_static(b"pushed")).await.unwrap();
        let pushed = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(pushed.payload.as_ref(), b"pushed");
        assert!(matches!(
            server.push("nope", Bytes::from_static(b"x")).await,
            Err(MeshError::ChannelNotFound(_))
        ));

        write_frame(&mut stream, OpCode::Close, &[], DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(disconnects.recv().await.unwrap(), "c1");
        wait_for_channels(&server, 0).await;
    }

    #[tokio::test]
    async fn test_rejected_and_duplicate_connections_get_close_frame() {
        let (server, addr, _disconnects) = start_server(Arc::new(FixedId("dup"))).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut bad, OpCode::Binary, b"wrong", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let frame = read_frame(&mut bad, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(String::from_utf8_lossy(&frame.payload).contains("bad token"));

        let mut first = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut first, OpCode::Binary, b"let me in", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        wait_for_channels(&server, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut second, OpCode::Binary, b"let me in", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let frame = read_frame(&mut second, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(server.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels_once() {
        let (server, addr, mut disconnects) = start_server(Arc::new(FixedId("c9"))).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, OpCode::Binary, b"let me in", DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        wait_for_channels(&server, 1).await;

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(disconnects.recv().await.unwrap(), "c9");
        assert_eq!(server.channel_count(), 0);
        assert!(matches!(
            server.shutdown(Duration::from_secs(1)).await,
            Err(MeshError::AlreadyClosed)
        ));
    }
}
