//! Protocol constants: service names, commands, metadata keys and status codes.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Service name of the login logic service.
pub const SN_LOGIN: &str = "login";
/// Service name of the chat logic service.
pub const SN_CHAT: &str = "chat";

pub const COMMAND_LOGIN_SIGN_IN: &str = "login.signin";
pub const COMMAND_LOGIN_SIGN_OUT: &str = "login.signout";
pub const COMMAND_CHAT_USER_TALK: &str = "chat.user.talk";

/// Id of the server a packet must be delivered to (gateway on the way back,
/// originating gateway on the way in).
pub const META_DEST_SERVER: &str = "dest.server";
/// Comma-separated channel ids a pushed packet fans out to.
pub const META_DEST_CHANNELS: &str = "dest.channels";

/// Transport a service instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Length-prefixed TCP framing. The only inter-service transport.
    Tcp,
    /// WebSocket framing, used by end-user facing gateways.
    #[serde(rename = "ws")]
    Websocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Websocket => "ws",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "ws" | "websocket" => Ok(Protocol::Websocket),
            other => Err(Error::UnknownProtocol(other.to_string())),
        }
    }
}

/// Packet direction flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    #[default]
    Request,
    Response,
    Push,
}

/// Response status carried in the packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Success,
    NoDestination,
    InvalidPacketBody,
    InvalidCommand,
    Unauthorized,
    SessionNotFound,
    NotImplemented,
    SystemException,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_round_trip() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("ws".parse::<Protocol>().unwrap(), Protocol::Websocket);
        assert_eq!(Protocol::Websocket.to_string(), "ws");
        assert!("udp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::NotImplemented).unwrap();
        assert_eq!(json, "\"not_implemented\"");
    }
}
