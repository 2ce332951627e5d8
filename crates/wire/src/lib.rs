//! Wire-level types shared by every service in the mesh.
//!
//! - `LogicPkt`: routed application packet (command, channel id, metadata, body)
//! - `BasicPkt`: tiny application-level ping/pong packet
//! - Body payloads exchanged by gateways and logic services
//! - `Location`: where a logged-in account's connection lives
//!
//! ## Marshaled layout
//!
//! ```text
//! LogicPkt: [magic 4][u32 BE header_len][header JSON][u32 BE body_len][body]
//! BasicPkt: [magic 4][u16 BE code][u16 BE body_len][body]
//! ```

pub mod error;
pub mod location;
pub mod messages;
pub mod packet;
pub mod protocol;

pub use error::{Error, Result};
pub use location::Location;
pub use messages::{
    ErrorResp, InnerHandshakeReq, KickoutNotify, LoginReq, LoginResp, MessagePush, MessageReq,
    MessageResp, Session,
};
pub use packet::{read_packet, BasicPkt, Header, LogicPkt, Meta, Packet};
pub use protocol::{Flag, Protocol, Status};
