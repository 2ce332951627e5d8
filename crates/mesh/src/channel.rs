//! One accepted connection turned into a message pipe.
//!
//! Outbound payloads go through a bounded queue drained by a single write
//! task, which coalesces whatever is queued into one flush. Inbound frames
//! are read by `readloop` and each payload is handed to the listener on its
//! own task, so listener-side ordering is not guaranteed.

use crate::config::ServerOptions;
use crate::connection::{FrameReader, FrameWriter, FramedConnection};
use crate::error::{MeshError, Result};
use crate::frame::OpCode;
use crate::traits::{Agent, MessageListener};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Accepted connection with a batched write path.
pub struct Channel {
    id: String,
    peer_addr: Option<SocketAddr>,
    tx: mpsc::Sender<Bytes>,
    writer: Arc<Mutex<FrameWriter>>,
    reader: StdMutex<Option<FrameReader>>,
    closed: CancellationToken,
    closing: AtomicBool,
    read_wait: Duration,
    write_wait: Duration,
    tasks: TaskTracker,
}

impl Channel {
    /// Wrap `conn` and start its write task on `tasks`.
    pub fn new(
        id: impl Into<String>,
        conn: FramedConnection,
        options: &ServerOptions,
        tasks: &TaskTracker,
    ) -> Arc<Self> {
        let id = id.into();
        let peer_addr = conn.peer_addr();
        let (reader, writer) = conn.into_split();
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let writer = Arc::new(Mutex::new(writer));
        let closed = CancellationToken::new();

        tasks.spawn(writeloop(
            id.clone(),
            rx,
            writer.clone(),
            closed.clone(),
            options.write_wait,
        ));

        Arc::new(Self {
            id,
            peer_addr,
            tx,
            writer,
            reader: StdMutex::new(Some(reader)),
            closed,
            closing: AtomicBool::new(false),
            read_wait: options.read_wait,
            write_wait: options.write_wait,
            tasks: tasks.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a payload for writing. Empty payloads are ignored. Waits while
    /// the queue is full.
    pub async fn push(&self, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(MeshError::ChannelClosed(self.id.clone())),
            sent = self.tx.send(payload) => {
                sent.map_err(|_| MeshError::ChannelClosed(self.id.clone()))
            }
        }
    }

    /// Read frames until an error, a close frame or `close()`.
    ///
    /// Pings are answered inline, empty payloads are skipped and every
    /// other payload is dispatched to `listener` on its own task. Can only
    /// run once per channel.
    pub async fn readloop(self: &Arc<Self>, listener: Arc<dyn MessageListener>) -> Result<()> {
        let mut reader = {
            let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take().ok_or(MeshError::AlreadyStarted)?
        };
        let agent: Arc<dyn Agent> = self.clone();

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    return Err(MeshError::ChannelClosed(self.id.clone()));
                }
                read = timeout(self.read_wait, reader.read_frame()) => match read {
                    Ok(frame) => frame?,
                    Err(_) => return Err(MeshError::Timeout("read")),
                },
            };

            match frame.opcode {
                OpCode::Close => return Err(MeshError::RemoteClosed),
                OpCode::Ping => {
                    trace!("Channel {} ping", self.id);
                    self.write_control(OpCode::Pong).await?;
                    continue;
                }
                _ => {}
            }
            if frame.payload.is_empty() {
                continue;
            }

            let listener = listener.clone();
            let agent = agent.clone();
            self.tasks
                .spawn(async move { listener.receive(agent, frame.payload).await });
        }
    }

    async fn write_control(&self, opcode: OpCode) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, async {
            writer.write_frame(opcode, &[]).await?;
            writer.flush().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout("write")),
        }
    }

    /// Close the channel. Only the first call has an effect; returns whether
    /// this call closed it.
    pub fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        debug!("Channel {} closed", self.id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[async_trait]
impl Agent for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, payload: Bytes) -> Result<()> {
        Channel::push(self, payload).await
    }
}

async fn writeloop(
    id: String,
    mut rx: mpsc::Receiver<Bytes>,
    writer: Arc<Mutex<FrameWriter>>,
    closed: CancellationToken,
    write_wait: Duration,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let mut w = writer.lock().await;
        let batch = async {
            w.write_frame(OpCode::Binary, &first).await?;
            let mut n = 1usize;
            while let Ok(payload) = rx.try_recv() {
                w.write_frame(OpCode::Binary, &payload).await?;
                n += 1;
            }
            w.flush().await?;
            Ok::<usize, MeshError>(n)
        };
        match timeout(write_wait, batch).await {
            Ok(Ok(n)) => trace!("Channel {} flushed {} frames", id, n),
            Ok(Err(e)) => {
                warn!("Channel {} write failed: {}", id, e);
                closed.cancel();
                break;
            }
            Err(_) => {
                warn!("Channel {} write timed out", id);
                closed.cancel();
                break;
            }
        }
    }

    let mut w = writer.lock().await;
    if let Ok(Err(e)) = timeout(write_wait, w.close()).await {
        debug!("Channel {} transport close: {}", id, e);
    }
}
