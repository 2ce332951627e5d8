//! Command routing for backend services.
//!
//! A [`Router`] maps commands to [`Handler`]s. Each request gets a
//! [`Context`] carrying the packet, the caller's session and the means to
//! answer (`resp`) or notify other users (`dispatch`).

use crate::error::{MeshError, Result};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use wire::protocol::META_DEST_SERVER;
use wire::{ErrorResp, Flag, Header, Location, LogicPkt, Session, Status};

/// Sends a packet to a set of channels on one gateway.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn push(&self, gateway: &str, channels: &[String], packet: LogicPkt) -> Result<()>;
}

/// Handles one command.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut Context) -> Result<()>;
}

/// Per-request state handed to a [`Handler`].
pub struct Context {
    request: LogicPkt,
    session: Option<Session>,
    dispatcher: Arc<dyn Dispatcher>,
    storage: Arc<dyn SessionStorage>,
}

impl Context {
    pub fn new(
        request: LogicPkt,
        session: Option<Session>,
        dispatcher: Arc<dyn Dispatcher>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            request,
            session,
            dispatcher,
            storage,
        }
    }

    pub fn header(&self) -> &Header {
        &self.request.header
    }

    pub fn request(&self) -> &LogicPkt {
        &self.request
    }

    pub fn read_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(self.request.read_body()?)
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Session of the caller. Without a stored session one is derived from
    /// the packet's channel id and its `dest.server` meta.
    pub fn session(&mut self) -> &Session {
        let request = &self.request;
        self.session.get_or_insert_with(|| Session {
            channel_id: request.header.channel_id.clone(),
            gate_id: request
                .get_meta(META_DEST_SERVER)
                .unwrap_or_default()
                .to_string(),
            tags: vec!["AutoGenerated".to_string()],
            ..Default::default()
        })
    }

    /// Answer the caller with `status` and `body`.
    pub async fn resp<T: Serialize + Sync>(&mut self, status: Status, body: Option<&T>) -> Result<()> {
        let mut packet = LogicPkt::from_header(&self.request.header);
        packet.header.status = status;
        packet.header.flag = Flag::Response;
        if let Some(body) = body {
            packet.write_body(body)?;
        }
        let session = self.session().clone();
        debug!(
            "Resp to {} ({}) command {} status {:?}",
            session.account, session.channel_id, packet.header.command, status
        );
        self.dispatcher
            .push(&session.gate_id, &[session.channel_id.clone()], packet)
            .await
            .inspect_err(|e| warn!("Resp to {} failed: {}", session.channel_id, e))
    }

    /// Answer the caller with an [`ErrorResp`] describing `err`.
    pub async fn resp_with_error(&mut self, status: Status, err: impl std::fmt::Display) -> Result<()> {
        let body = ErrorResp {
            message: err.to_string(),
        };
        self.resp(status, Some(&body)).await
    }

    /// Push `body` to every location except the caller's own channel, one
    /// push per gateway. Stops at the first failure.
    pub async fn dispatch<T: Serialize + Sync>(&mut self, body: &T, locations: &[Location]) -> Result<()> {
        if locations.is_empty() {
            return Ok(());
        }
        let mut packet = LogicPkt::from_header(&self.request.header);
        packet.header.flag = Flag::Push;
        packet.write_body(body)?;

        let own = self.session().channel_id.clone();
        let mut by_gateway: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for loc in locations.iter().filter(|l| l.channel_id != own) {
            by_gateway
                .entry(loc.gate_id.as_str())
                .or_default()
                .push(loc.channel_id.clone());
        }
        debug!(
            "Dispatch {} to {} gateways",
            packet.header.command,
            by_gateway.len()
        );
        for (gateway, channels) in by_gateway {
            self.dispatcher.push(gateway, &channels, packet.clone()).await?;
        }
        Ok(())
    }
}

/// Command -> handler table.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`, replacing any earlier one.
    pub fn handle(&mut self, command: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(command.into(), handler);
        self
    }

    /// Run the handler for `packet`. Unknown commands are answered with
    /// `NotImplemented`.
    pub async fn serve(
        &self,
        packet: LogicPkt,
        session: Option<Session>,
        dispatcher: Arc<dyn Dispatcher>,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<()> {
        let handler = self.handlers.get(packet.command()).cloned();
        let mut ctx = Context::new(packet, session, dispatcher, storage);
        match handler {
            Some(handler) => handler.handle(&mut ctx).await,
            None => {
                let command = ctx.header().command.clone();
                ctx.resp_with_error(Status::NotImplemented, format!("{} not implemented", command))
                    .await?;
                Err(MeshError::InvalidPacket("unknown command"))
            }
        }
    }
}
