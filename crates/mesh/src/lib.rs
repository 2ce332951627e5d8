//! Connection and routing mesh for the IM cluster.
//!
//! Gateways terminate end-user connections and forward each packet to a
//! backend instance; backends push packets back to the exact gateway and
//! channel a user is attached to.
//!
//! ## Architecture
//!
//! ```text
//! FramedConnection (TCP | WebSocket)
//!         ↓
//! Channel (bounded queue, batched writes)  <-- MeshServer accept loop
//!         ↓
//! MessageListener (per service)
//!         ↓
//! Container.forward(service) --> ClientPool --Selector--> OutboundClient
//! ```
//!
//! - `Naming` discovers peers; `ClientPool`s hold one client per peer id
//! - New peers are `young` for a grace delay before they are routed to
//! - `SessionStorage` and `Router` serve backend request handling

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod container;
pub mod dialer;
pub mod error;
pub mod frame;
pub mod naming;
pub mod pool;
pub mod router;
pub mod selector;
pub mod server;
pub mod storage;
pub mod traits;

pub use channel::Channel;
pub use client::OutboundClient;
pub use config::{ClientOptions, ContainerOptions, ServerOptions};
pub use connection::{boxed, BoxedStream, FrameReader, FrameWriter, FramedConnection};
pub use container::{Container, ContainerState};
pub use dialer::{Dialer, DialerContext, PlainTcpDialer};
pub use error::{MeshError, Result};
pub use frame::{Frame, OpCode};
pub use naming::{
    MemoryNaming, Naming, Service, ServiceCallback, ServiceInstance, ServiceMeta,
    KEY_SERVICE_STATE, STATE_ADULT, STATE_YOUNG,
};
pub use pool::ClientPool;
pub use router::{Context, Dispatcher, Handler, Router};
pub use selector::{HashSelector, Selector};
pub use server::{ChannelMap, DefaultAcceptor, MeshServer};
pub use storage::{MemoryStorage, SessionStorage};
pub use traits::{Acceptor, Agent, MessageListener, Server, StateListener};
