//! Sign-in and sign-out.

use async_trait::async_trait;
use mesh::{Context, Handler, MeshError};
use std::slice;
use tracing::{info, warn};
use wire::{KickoutNotify, LoginResp, Session, Status};

/// `login.signin`: the gateway has already authenticated the user and put
/// the session in the body. A previous login of the same account is kicked
/// out before the new session is stored.
pub struct LoginHandler;

#[async_trait]
impl Handler for LoginHandler {
    async fn handle(&self, ctx: &mut Context) -> mesh::Result<()> {
        let session: Session = match ctx.read_body() {
            Ok(session) => session,
            Err(e) => return ctx.resp_with_error(Status::InvalidPacketBody, e).await,
        };
        info!(
            "Login {} on {} from {}",
            session.account, session.channel_id, session.remote_ip
        );

        let storage = ctx.storage().clone();
        match storage.get_location(&session.account).await {
            Ok(old) if old.channel_id != session.channel_id => {
                info!("Kicking out {} on {}", session.account, old.channel_id);
                let notify = KickoutNotify {
                    channel_id: old.channel_id.clone(),
                };
                if let Err(e) = ctx.dispatch(&notify, slice::from_ref(&old)).await {
                    warn!("Kickout of {} not delivered: {}", old.channel_id, e);
                }
            }
            Ok(_) | Err(MeshError::SessionNotFound(_)) => {}
            Err(e) => return ctx.resp_with_error(Status::SystemException, e).await,
        }

        if let Err(e) = storage.add(&session).await {
            return ctx.resp_with_error(Status::SystemException, e).await;
        }
        let resp = LoginResp {
            channel_id: session.channel_id,
            account: session.account,
        };
        ctx.resp(Status::Success, Some(&resp)).await
    }
}

/// `login.signout`: drop the caller's session.
pub struct LogoutHandler;

#[async_trait]
impl Handler for LogoutHandler {
    async fn handle(&self, ctx: &mut Context) -> mesh::Result<()> {
        let session = ctx.session().clone();
        info!("Logout {} on {}", session.account, session.channel_id);
        let storage = ctx.storage().clone();
        if let Err(e) = storage.delete(&session.account, &session.channel_id).await {
            return ctx.resp_with_error(Status::SystemException, e).await;
        }
        ctx.resp::<()>(Status::Success, None).await
    }
}
