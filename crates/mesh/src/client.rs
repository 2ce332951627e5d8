//! Connection this process initiated to one peer service instance.

use crate::config::ClientOptions;
use crate::connection::{FrameReader, FrameWriter, FramedConnection};
use crate::dialer::{Dialer, DialerContext};
use crate::error::{MeshError, Result};
use crate::frame::{Frame, OpCode};
use crate::naming::{Service, ServiceMeta};
use metrics::gauge;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use url::Url;

const STATE_IDLE: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Client side of an inter-service link.
///
/// Lifecycle is `idle -> connected -> closed`. A closed client is never
/// reconnected; build a new one instead.
pub struct OutboundClient {
    id: String,
    name: String,
    meta: Arc<ServiceMeta>,
    options: ClientOptions,
    dialer: Arc<dyn Dialer>,
    state: AtomicU8,
    writer: Mutex<Option<FrameWriter>>,
    reader: Mutex<Option<FrameReader>>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl OutboundClient {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        meta: Arc<ServiceMeta>,
        options: ClientOptions,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            meta,
            options,
            dialer,
            state: AtomicU8::new(STATE_IDLE),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn the heartbeat on `tasks` so its owner can wait for it.
    pub fn with_tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &Arc<ServiceMeta> {
        &self.meta
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    /// Dial `address` through the dialer, frame the stream and start the
    /// heartbeat. Fails fast when already connected or closed.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<()> {
        validate_address(address)?;
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_CONNECTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_CONNECTED) => return Err(MeshError::AlreadyConnected),
            Err(_) => return Err(MeshError::AlreadyClosed),
        }

        let ctx = DialerContext {
            id: self.id.clone(),
            name: self.name.clone(),
            address: address.to_string(),
            timeout: self.options.login_wait,
        };
        let stream = match self.dialer.dial_and_handshake(&ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.state.compare_exchange(
                    STATE_CONNECTED,
                    STATE_IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Err(e);
            }
        };

        let (reader, writer) =
            FramedConnection::tcp(stream, self.options.max_frame_size).into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        if self.closed.is_cancelled() {
            self.reader.lock().await.take();
            self.writer.lock().await.take();
            return Err(MeshError::AlreadyClosed);
        }
        gauge!("mesh_clients_connected").increment(1.0);
        info!("Connected to {} ({}) at {}", self.id, self.name, address);

        if !self.options.heartbeat.is_zero() {
            self.tasks
                .spawn(heartbeat(Arc::downgrade(self), self.closed.clone()));
        }
        Ok(())
    }

    /// Write one binary frame.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.write(OpCode::Binary, payload).await
    }

    async fn write(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.not_ready())?;
        timeout(self.options.write_wait, async {
            writer.write_frame(opcode, payload).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| MeshError::Timeout("write"))?
    }

    /// Read one frame. A close frame is reported as `RemoteClosed`.
    pub async fn read(&self) -> Result<Frame> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.not_ready())?;
        let frame = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(MeshError::AlreadyClosed),
            read = timeout(self.options.read_wait, reader.read_frame()) => {
                read.map_err(|_| MeshError::Timeout("read"))??
            }
        };
        if frame.is_close() {
            return Err(MeshError::RemoteClosed);
        }
        Ok(frame)
    }

    /// Close the client. Idempotent; the close frame is best effort.
    pub async fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        self.closed.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            gauge!("mesh_clients_connected").decrement(1.0);
            let result = timeout(self.options.write_wait, async {
                writer.write_frame(OpCode::Close, &[]).await?;
                writer.flush().await?;
                writer.close().await
            })
            .await;
            if let Ok(Err(e)) = result {
                debug!("Client {} close frame: {}", self.id, e);
            }
        }
        self.reader.lock().await.take();
        info!("Client {} ({}) closed", self.id, self.name);
    }

    fn not_ready(&self) -> MeshError {
        if self.state.load(Ordering::Acquire) == STATE_CLOSED {
            MeshError::AlreadyClosed
        } else {
            MeshError::NotConnected
        }
    }
}

impl Service for OutboundClient {
    fn service_id(&self) -> &str {
        &self.id
    }

    fn service_name(&self) -> &str {
        &self.name
    }

    fn get_meta(&self, key: &str) -> Option<String> {
        self.meta.get(key)
    }
}

async fn heartbeat(client: Weak<OutboundClient>, closed: CancellationToken) {
    let period = match client.upgrade() {
        Some(c) => c.options.heartbeat,
        None => return,
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(client) = client.upgrade() else {
            return;
        };
        if let Err(e) = client.write(OpCode::Ping, &[]).await {
            warn!("Heartbeat to {} failed: {}", client.id, e);
            return;
        }
        trace!("Ping sent to {}", client.id);
    }
}

/// Accepts `host:port` or a URL with a host and a port.
fn validate_address(address: &str) -> Result<()> {
    let invalid = || MeshError::InvalidAddress(address.to_string());
    if address.contains("://") {
        let url = Url::parse(address).map_err(|_| invalid())?;
        if url.host_str().map_or(true, str::is_empty) || url.port_or_known_default().is_none() {
            return Err(invalid());
        }
        return Ok(());
    }
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}
