//! Dialer the gateway uses to reach logic services.

use async_trait::async_trait;
use mesh::connection::{write_frame, DEFAULT_MAX_FRAME_SIZE};
use mesh::dialer::dial_tcp;
use mesh::{boxed, BoxedStream, Dialer, DialerContext, OpCode};
use tracing::debug;
use wire::InnerHandshakeReq;

/// Connects over TCP and introduces itself with an [`InnerHandshakeReq`]
/// so the logic service can key the channel by this gateway's id.
pub struct HandshakeDialer {
    service_id: String,
}

impl HandshakeDialer {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }
}

#[async_trait]
impl Dialer for HandshakeDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> mesh::Result<BoxedStream> {
        let mut stream = dial_tcp(&ctx.address, ctx.timeout).await?;
        let req = InnerHandshakeReq {
            service_id: self.service_id.clone(),
        };
        let payload = serde_json::to_vec(&req)?;
        write_frame(&mut stream, OpCode::Binary, &payload, DEFAULT_MAX_FRAME_SIZE).await?;
        debug!("Handshake sent to {} ({}) as {}", ctx.id, ctx.address, self.service_id);
        Ok(boxed(stream))
    }
}
