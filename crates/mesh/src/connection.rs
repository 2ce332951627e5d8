//! Framed connection over TCP or WebSocket.
//!
//! Both transports expose the same `read_frame` / `write_frame` / `flush`
//! surface. On TCP a frame is `[u8 opcode][u32 BE length][payload]` and
//! writes go straight to the socket, so `flush` is a no-op. On WebSocket the
//! native frame carries the length, writes are buffered by the sink and
//! `flush` pushes them out.

use crate::error::{MeshError, Result};
use crate::frame::{Frame, OpCode};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Default upper bound for a single frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const TCP_FRAME_HEADER_LEN: usize = 5;
// Control frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON_LEN: usize = 123;

/// Byte stream a connection can be framed over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased byte stream (a `TcpStream`, a `DuplexStream` in tests, ...).
pub type BoxedStream = Box<dyn IoStream>;

pub fn boxed<S: IoStream>(stream: S) -> BoxedStream {
    Box::new(stream)
}

type WsStream = WebSocketStream<BoxedStream>;

/// Read one TCP-framed frame.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let op = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        return Err(MeshError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    let opcode = OpCode::from_u8(op).ok_or(MeshError::InvalidPacket("unknown opcode"))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::new(opcode, payload))
}

/// Write one TCP-framed frame.
pub async fn write_frame<W>(
    writer: &mut W,
    opcode: OpCode,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame_size {
        return Err(MeshError::FrameTooLarge {
            size: payload.len(),
            max: max_frame_size,
        });
    }
    let mut buf = BytesMut::with_capacity(TCP_FRAME_HEADER_LEN + payload.len());
    buf.put_u8(opcode.as_u8());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    Ok(())
}

enum ReadInner {
    Tcp(BufReader<ReadHalf<BoxedStream>>),
    WebSocket(SplitStream<WsStream>),
}

/// Read half of a framed connection.
pub struct FrameReader {
    inner: ReadInner,
    max_frame_size: usize,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<Frame> {
        match &mut self.inner {
            ReadInner::Tcp(r) => read_frame(r, self.max_frame_size).await,
            ReadInner::WebSocket(s) => {
                let msg = match s.next().await {
                    Some(msg) => msg?,
                    None => return Err(MeshError::RemoteClosed),
                };
                let frame = match msg {
                    Message::Binary(data) => Frame::new(OpCode::Binary, Bytes::from(data)),
                    Message::Text(text) => Frame::new(OpCode::Text, Bytes::from(text)),
                    Message::Ping(data) => Frame::new(OpCode::Ping, Bytes::from(data)),
                    Message::Pong(data) => Frame::new(OpCode::Pong, Bytes::from(data)),
                    Message::Close(cf) => Frame::new(
                        OpCode::Close,
                        cf.map(|c| Bytes::from(c.reason.to_string()))
                            .unwrap_or_default(),
                    ),
                    Message::Frame(f) => Frame::new(OpCode::Continuation, Bytes::from(f.into_data())),
                };
                if frame.payload.len() > self.max_frame_size {
                    return Err(MeshError::FrameTooLarge {
                        size: frame.payload.len(),
                        max: self.max_frame_size,
                    });
                }
                Ok(frame)
            }
        }
    }
}

enum WriteInner {
    Tcp(WriteHalf<BoxedStream>),
    WebSocket(SplitSink<WsStream, Message>),
}

/// Write half of a framed connection.
pub struct FrameWriter {
    inner: WriteInner,
    max_frame_size: usize,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriteInner::Tcp(w) => write_frame(w, opcode, payload, self.max_frame_size).await,
            WriteInner::WebSocket(sink) => {
                if payload.len() > self.max_frame_size {
                    return Err(MeshError::FrameTooLarge {
                        size: payload.len(),
                        max: self.max_frame_size,
                    });
                }
                sink.feed(to_message(opcode, payload)?).await?;
                Ok(())
            }
        }
    }

    /// Push buffered frames to the transport. A no-op on TCP.
    pub async fn flush(&mut self) -> Result<()> {
        match &mut self.inner {
            WriteInner::Tcp(_) => Ok(()),
            WriteInner::WebSocket(sink) => {
                sink.flush().await?;
                Ok(())
            }
        }
    }

    /// Close the write side of the transport.
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.inner {
            WriteInner::Tcp(w) => {
                w.shutdown().await?;
                Ok(())
            }
            WriteInner::WebSocket(sink) => {
                sink.close().await?;
                Ok(())
            }
        }
    }
}

fn to_message(opcode: OpCode, payload: &[u8]) -> Result<Message> {
    let msg = match opcode {
        OpCode::Binary => Message::Binary(payload.to_vec().into()),
        OpCode::Text => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| MeshError::InvalidPacket("text frame is not valid UTF-8"))?;
            Message::Text(text.into())
        }
        OpCode::Ping => Message::Ping(payload.to_vec().into()),
        OpCode::Pong => Message::Pong(payload.to_vec().into()),
        OpCode::Close => {
            let mut reason = String::from_utf8_lossy(payload).into_owned();
            if reason.len() > MAX_CLOSE_REASON_LEN {
                let mut cut = MAX_CLOSE_REASON_LEN;
                while !reason.is_char_boundary(cut) {
                    cut -= 1;
                }
                reason.truncate(cut);
            }
            Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            }))
        }
        OpCode::Continuation => {
            return Err(MeshError::InvalidPacket(
                "continuation frames cannot be written directly",
            ))
        }
    };
    Ok(msg)
}

/// A framed duplex connection, TCP or WebSocket.
pub struct FramedConnection {
    reader: FrameReader,
    writer: FrameWriter,
    peer_addr: Option<SocketAddr>,
    websocket: bool,
}

impl FramedConnection {
    /// Frame a raw stream with the TCP length-prefixed codec.
    pub fn tcp(stream: BoxedStream, max_frame_size: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                inner: ReadInner::Tcp(BufReader::new(r)),
                max_frame_size,
            },
            writer: FrameWriter {
                inner: WriteInner::Tcp(w),
                max_frame_size,
            },
            peer_addr: None,
            websocket: false,
        }
    }

    /// Wrap an already upgraded WebSocket stream.
    pub fn websocket(ws: WsStream, max_frame_size: usize) -> Self {
        let (sink, stream) = ws.split();
        Self {
            reader: FrameReader {
                inner: ReadInner::WebSocket(stream),
                max_frame_size,
            },
            writer: FrameWriter {
                inner: WriteInner::WebSocket(sink),
                max_frame_size,
            },
            peer_addr: None,
            websocket: true,
        }
    }

    /// Run the server side of the WebSocket upgrade on `stream`.
    pub async fn accept_websocket(stream: BoxedStream, max_frame_size: usize) -> Result<Self> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_frame_size);
        config.max_frame_size = Some(max_frame_size);
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
        Ok(Self::websocket(ws, max_frame_size))
    }

    /// Run the client side of the WebSocket upgrade on `stream`.
    pub async fn connect_websocket(
        url: &str,
        stream: BoxedStream,
        max_frame_size: usize,
    ) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::client_async(url, stream).await?;
        Ok(Self::websocket(ws, max_frame_size))
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(opcode, payload).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}
