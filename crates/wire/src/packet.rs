//! Logic and basic packets.
//!
//! A `LogicPkt` is what gateways forward and logic services answer. Its
//! header metadata is an ordered list so that tagging a packet (e.g. with
//! `dest.server`) only appends bytes to the header; nothing already present
//! is reordered.

use crate::error::{Error, Result};
use crate::protocol::{Flag, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

pub const MAGIC_LOGIC_PKT: [u8; 4] = [0xc3, 0x11, 0xa3, 0x65];
pub const MAGIC_BASIC_PKT: [u8; 4] = [0xc3, 0x15, 0xa7, 0x65];

pub const CODE_PING: u16 = 1;
pub const CODE_PONG: u16 = 2;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Next process-wide packet sequence number (starts at 1, wraps).
pub fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// One header metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub key: String,
    pub value: String,
}

/// Logic packet header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub command: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default)]
    pub flag: Flag,
    #[serde(default)]
    pub status: Status,
    /// Destination account or group (chat commands).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Meta>,
}

/// Routed application packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicPkt {
    pub header: Header,
    pub body: Bytes,
}

impl LogicPkt {
    /// Create a request packet for `command` with a fresh sequence number.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            header: Header {
                command: command.into(),
                sequence: next_sequence(),
                ..Default::default()
            },
            body: Bytes::new(),
        }
    }

    /// Build a packet answering `header`: command, channel id, sequence and
    /// dest are copied, metadata is not.
    pub fn from_header(header: &Header) -> Self {
        Self {
            header: Header {
                command: header.command.clone(),
                channel_id: header.channel_id.clone(),
                sequence: header.sequence,
                dest: header.dest.clone(),
                ..Default::default()
            },
            body: Bytes::new(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.header.channel_id = channel_id.into();
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.header.dest = dest.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.header.command
    }

    pub fn channel_id(&self) -> &str {
        &self.header.channel_id
    }

    /// Logical service this packet targets: the command prefix before the first `.`.
    pub fn service_name(&self) -> &str {
        let command = self.header.command.as_str();
        command.split_once('.').map(|(sn, _)| sn).unwrap_or(command)
    }

    /// Append a metadata entry.
    pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.meta.push(Meta {
            key: key.into(),
            value: value.into(),
        });
    }

    /// First metadata value stored under `key`.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.header
            .meta
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }

    /// Remove every metadata entry stored under `key`.
    pub fn del_meta(&mut self, key: &str) {
        self.header.meta.retain(|m| m.key != key);
    }

    /// Serialize `body` as the packet body.
    pub fn write_body<T: Serialize>(&mut self, body: &T) -> Result<()> {
        self.body = Bytes::from(serde_json::to_vec(body)?);
        Ok(())
    }

    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.write_body(body)?;
        Ok(self)
    }

    pub fn read_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Encode as `[magic][u32 header_len][header][u32 body_len][body]`.
    pub fn marshal(&self) -> Result<Bytes> {
        let header = serde_json::to_vec(&self.header)?;
        let mut buf = BytesMut::with_capacity(4 + 4 + header.len() + 4 + self.body.len());
        buf.put_slice(&MAGIC_LOGIC_PKT);
        put_u32_prefixed(&mut buf, &header)?;
        put_u32_prefixed(&mut buf, &self.body)?;
        Ok(buf.freeze())
    }

    /// Decode a marshaled logic packet, magic included.
    pub fn decode(data: &[u8]) -> Result<Self> {
        match read_packet(data)? {
            Packet::Logic(pkt) => Ok(pkt),
            Packet::Basic(_) => Err(Error::InvalidMagic(MAGIC_BASIC_PKT)),
        }
    }

    fn decode_after_magic(mut buf: &[u8]) -> Result<Self> {
        let header = take_u32_prefixed(&mut buf)?;
        let body = take_u32_prefixed(&mut buf)?;
        Ok(Self {
            header: serde_json::from_slice(&header)?,
            body,
        })
    }
}

/// Application-level keepalive packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicPkt {
    pub code: u16,
    pub body: Bytes,
}

impl BasicPkt {
    pub fn ping() -> Self {
        Self {
            code: CODE_PING,
            body: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            code: CODE_PONG,
            body: Bytes::new(),
        }
    }

    pub fn marshal(&self) -> Result<Bytes> {
        if self.body.len() > u16::MAX as usize {
            return Err(Error::TooLong(self.body.len()));
        }
        let mut buf = BytesMut::with_capacity(4 + 2 + 2 + self.body.len());
        buf.put_slice(&MAGIC_BASIC_PKT);
        buf.put_u16(self.code);
        buf.put_u16(self.body.len() as u16);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    fn decode_after_magic(mut buf: &[u8]) -> Result<Self> {
        ensure(buf, 4)?;
        let code = buf.get_u16();
        let len = buf.get_u16() as usize;
        ensure(buf, len)?;
        Ok(Self {
            code,
            body: Bytes::copy_from_slice(&buf[..len]),
        })
    }
}

/// Either kind of packet, as read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Logic(LogicPkt),
    Basic(BasicPkt),
}

/// Decode a packet, dispatching on its magic.
pub fn read_packet(data: &[u8]) -> Result<Packet> {
    ensure(data, 4)?;
    let magic = [data[0], data[1], data[2], data[3]];
    let rest = &data[4..];
    match magic {
        MAGIC_LOGIC_PKT => Ok(Packet::Logic(LogicPkt::decode_after_magic(rest)?)),
        MAGIC_BASIC_PKT => Ok(Packet::Basic(BasicPkt::decode_after_magic(rest)?)),
        other => Err(Error::InvalidMagic(other)),
    }
}

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(Error::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

fn put_u32_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| Error::TooLong(data.len()))?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn take_u32_prefixed(buf: &mut &[u8]) -> Result<Bytes> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}
