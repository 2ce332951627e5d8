//! Edge gateway for the IM cluster.
//!
//! The gateway terminates end-user connections (WebSocket or TCP), logs
//! them in through the `login` service and relays packets both ways:
//!
//! ```text
//! user --ws--> MeshServer --GatewayHandler.receive--> Container.forward(service)
//!                                                          |
//! user <--ws-- Channel <--push_message-- Container <--tcp--+ logic service
//! ```
//!
//! The first packet on a connection must be `login.signin`; the channel id
//! `{gateway}_{account}_{seq}` is assigned here and carried in the session
//! forwarded to `login`.

pub mod config;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod health;

pub use config::Config;
pub use dialer::HandshakeDialer;
pub use error::{GatewayError, Result};
pub use handler::{channel_id, GatewayHandler};
pub use health::create_router;
