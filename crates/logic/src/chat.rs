//! One-to-one chat.

use async_trait::async_trait;
use chrono::Utc;
use mesh::{Context, Handler, MeshError};
use std::slice;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;
use wire::{MessagePush, MessageReq, MessageResp, Status};

/// Time-ordered message ids: milliseconds in the high bits, a per-process
/// counter in the low 20.
#[derive(Debug, Default)]
pub struct MessageIds {
    seq: AtomicI64,
}

impl MessageIds {
    pub fn next(&self) -> i64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
        (Utc::now().timestamp_millis() << 20) | seq
    }
}

/// `chat.user.talk`: deliver a message to `header.dest` if they are online
/// and answer the sender with the message id.
#[derive(Default)]
pub struct TalkHandler {
    ids: MessageIds,
}

impl TalkHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Handler for TalkHandler {
    async fn handle(&self, ctx: &mut Context) -> mesh::Result<()> {
        let receiver = ctx.header().dest.clone();
        if receiver.is_empty() {
            return ctx.resp_with_error(Status::NoDestination, "dest is empty").await;
        }
        let req: MessageReq = match ctx.read_body() {
            Ok(req) => req,
            Err(e) => return ctx.resp_with_error(Status::InvalidPacketBody, e).await,
        };
        let storage = ctx.storage().clone();
        let location = match storage.get_location(&receiver).await {
            Ok(location) => Some(location),
            Err(MeshError::SessionNotFound(_)) => None,
            Err(e) => return ctx.resp_with_error(Status::SystemException, e).await,
        };

        let send_time = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let message_id = self.ids.next();
        let sender = ctx.session().account.clone();
        match location {
            Some(location) => {
                let push = MessagePush {
                    message_id,
                    kind: req.kind,
                    body: req.body,
                    extra: req.extra,
                    sender,
                    send_time,
                };
                if let Err(e) = ctx.dispatch(&push, slice::from_ref(&location)).await {
                    return ctx.resp_with_error(Status::SystemException, e).await;
                }
            }
            None => debug!("{} is offline, message {} not pushed", receiver, message_id),
        }
        ctx.resp(
            Status::Success,
            Some(&MessageResp {
                message_id,
                send_time,
            }),
        )
        .await
    }
}
