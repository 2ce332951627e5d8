//! Transport handler of a logic service: gateway handshake and request
//! dispatch into the [`Router`].

use async_trait::async_trait;
use bytes::Bytes;
use mesh::{
    Acceptor, Agent, Context, Dispatcher, FramedConnection, MeshError, MessageListener, OpCode,
    Router, SessionStorage, StateListener,
};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wire::protocol::COMMAND_LOGIN_SIGN_IN;
use wire::{InnerHandshakeReq, LogicPkt, Session, Status};

pub struct ServHandler {
    router: Router,
    dispatcher: Arc<dyn Dispatcher>,
    storage: Arc<dyn SessionStorage>,
}

impl ServHandler {
    pub fn new(
        router: Router,
        dispatcher: Arc<dyn Dispatcher>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            router,
            dispatcher,
            storage,
        }
    }

    /// Session the request runs under. Sign-in carries its session in the
    /// body, every other command needs a stored one.
    async fn session_for(&self, packet: &LogicPkt) -> Result<Option<Session>, (Status, MeshError)> {
        if packet.command() == COMMAND_LOGIN_SIGN_IN {
            return Ok(None);
        }
        match self.storage.get(packet.channel_id()).await {
            Ok(session) => Ok(Some(session)),
            Err(e @ MeshError::SessionNotFound(_)) => Err((Status::SessionNotFound, e)),
            Err(e) => Err((Status::SystemException, e)),
        }
    }

    pub async fn serve(&self, packet: LogicPkt) -> mesh::Result<()> {
        let session = match self.session_for(&packet).await {
            Ok(session) => session,
            Err((status, e)) => {
                warn!("No session for {} ({}): {}", packet.channel_id(), packet.command(), e);
                let mut ctx = Context::new(packet, None, self.dispatcher.clone(), self.storage.clone());
                ctx.resp_with_error(status, &e).await?;
                return Err(e);
            }
        };
        self.router
            .serve(packet, session, self.dispatcher.clone(), self.storage.clone())
            .await
    }
}

#[async_trait]
impl Acceptor for ServHandler {
    /// The first frame of a gateway link names the gateway; its id becomes
    /// the channel id so responses can be pushed back by gateway id.
    async fn accept(&self, conn: &mut FramedConnection, login_wait: Duration) -> mesh::Result<String> {
        let frame = timeout(login_wait, conn.read_frame())
            .await
            .map_err(|_| MeshError::Timeout("handshake"))??;
        if frame.opcode != OpCode::Binary {
            return Err(MeshError::Handshake(format!("unexpected {} frame", frame.opcode)));
        }
        let req: InnerHandshakeReq = serde_json::from_slice(&frame.payload)?;
        if req.service_id.is_empty() {
            return Err(MeshError::Handshake("service id is empty".into()));
        }
        info!("Gateway {} connected", req.service_id);
        Ok(req.service_id)
    }
}

#[async_trait]
impl MessageListener for ServHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
        let packet = match LogicPkt::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Undecodable packet from {}: {}", agent.id(), e);
                return;
            }
        };
        let command = packet.header.command.clone();
        debug!("{} from {} via {}", command, packet.channel_id(), agent.id());
        counter!("logic_requests_total", "command" => command.clone()).increment(1);
        if let Err(e) = self.serve(packet).await {
            warn!("{} via {} failed: {}", command, agent.id(), e);
        }
    }
}

#[async_trait]
impl StateListener for ServHandler {
    async fn disconnect(&self, id: &str) -> mesh::Result<()> {
        info!("Gateway {} disconnected", id);
        Ok(())
    }
}
