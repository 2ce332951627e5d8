//! Gateway connection handling: login, inbound routing and logout.

use async_trait::async_trait;
use bytes::Bytes;
use mesh::{
    Acceptor, Agent, Container, FramedConnection, MeshError, MessageListener, OpCode,
    StateListener,
};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wire::packet::{next_sequence, CODE_PING};
use wire::protocol::{
    COMMAND_LOGIN_SIGN_IN, COMMAND_LOGIN_SIGN_OUT, META_DEST_CHANNELS, META_DEST_SERVER, SN_LOGIN,
};
use wire::{read_packet, BasicPkt, Flag, LogicPkt, LoginReq, Packet, Session, Status};

/// Channel id of a login: `{gateway}_{account}_{seq}`.
pub fn channel_id(service_id: &str, account: &str) -> String {
    format!("{}_{}_{}", service_id, account, next_sequence())
}

/// Routing metadata is set by the mesh, never by users.
fn strip_routing_meta(packet: &mut LogicPkt) {
    packet.del_meta(META_DEST_SERVER);
    packet.del_meta(META_DEST_CHANNELS);
}

/// Acceptor, message listener and state listener of the gateway server.
pub struct GatewayHandler {
    service_id: String,
    container: Container,
}

impl GatewayHandler {
    pub fn new(service_id: impl Into<String>, container: Container) -> Self {
        Self {
            service_id: service_id.into(),
            container,
        }
    }

    /// Answer the login request directly on the connection. Best effort:
    /// the connection is rejected either way.
    async fn reject(&self, conn: &mut FramedConnection, request: &LogicPkt, status: Status) {
        let mut resp = LogicPkt::from_header(&request.header);
        resp.header.status = status;
        resp.header.flag = Flag::Response;
        if let Ok(payload) = resp.marshal() {
            if conn.write_frame(OpCode::Binary, &payload).await.is_ok() {
                let _ = conn.flush().await;
            }
        }
        counter!("gateway_login_rejected_total", "status" => format!("{:?}", status)).increment(1);
    }
}

#[async_trait]
impl Acceptor for GatewayHandler {
    async fn accept(&self, conn: &mut FramedConnection, login_wait: Duration) -> mesh::Result<String> {
        let frame = timeout(login_wait, conn.read_frame())
            .await
            .map_err(|_| MeshError::Timeout("login"))??;
        if frame.opcode != OpCode::Binary {
            return Err(MeshError::Handshake(format!("unexpected {} frame", frame.opcode)));
        }
        let mut request = LogicPkt::decode(&frame.payload)?;

        if request.command() != COMMAND_LOGIN_SIGN_IN {
            self.reject(conn, &request, Status::InvalidCommand).await;
            return Err(MeshError::Handshake(format!(
                "first packet must be {}, got {}",
                COMMAND_LOGIN_SIGN_IN,
                request.command()
            )));
        }
        let login: LoginReq = match request.read_body() {
            Ok(login) => login,
            Err(e) => {
                self.reject(conn, &request, Status::InvalidPacketBody).await;
                return Err(e.into());
            }
        };
        if login.account.is_empty() {
            self.reject(conn, &request, Status::Unauthorized).await;
            return Err(MeshError::Handshake("account is empty".into()));
        }

        let id = channel_id(&self.service_id, &login.account);
        strip_routing_meta(&mut request);
        request.header.channel_id = id.clone();
        request.write_body(&Session {
            channel_id: id.clone(),
            gate_id: self.service_id.clone(),
            account: login.account.clone(),
            app: login.app,
            remote_ip: conn
                .peer_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_default(),
            ..Default::default()
        })?;
        self.container.forward(SN_LOGIN, request).await?;
        info!("Accepted {} as {}", login.account, id);
        Ok(id)
    }
}

#[async_trait]
impl MessageListener for GatewayHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
        let packet = match read_packet(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Undecodable packet from {}: {}", agent.id(), e);
                return;
            }
        };
        match packet {
            Packet::Basic(basic) => {
                if basic.code != CODE_PING {
                    return;
                }
                match BasicPkt::pong().marshal() {
                    Ok(pong) => {
                        if let Err(e) = agent.push(pong).await {
                            debug!("Pong to {} failed: {}", agent.id(), e);
                        }
                    }
                    Err(e) => warn!("Pong encode failed: {}", e),
                }
            }
            Packet::Logic(mut logic) => {
                strip_routing_meta(&mut logic);
                logic.header.channel_id = agent.id().to_string();
                let service = logic.service_name().to_string();
                let command = logic.header.command.clone();
                if let Err(e) = self.container.forward(&service, logic).await {
                    warn!(
                        "Forward {} from {} (dest {}) failed: {}",
                        command,
                        agent.id(),
                        service,
                        e
                    );
                }
            }
        }
    }
}

#[async_trait]
impl StateListener for GatewayHandler {
    async fn disconnect(&self, id: &str) -> mesh::Result<()> {
        info!("Channel {} disconnected", id);
        let logout = LogicPkt::new(COMMAND_LOGIN_SIGN_OUT).with_channel(id);
        if let Err(e) = self.container.forward(SN_LOGIN, logout).await {
            warn!("Logout of {} not delivered: {}", id, e);
        }
        Ok(())
    }
}
