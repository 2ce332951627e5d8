//! Backend logic service.
//!
//! One binary serves either `login` (session bookkeeping) or `chat`
//! (message delivery). Gateways dial in over TCP and identify themselves
//! with an `InnerHandshakeReq`; responses and pushes travel back over the
//! same link keyed by gateway id.

pub mod chat;
pub mod config;
pub mod error;
pub mod handler;
pub mod login;

pub use chat::{MessageIds, TalkHandler};
pub use config::Config;
pub use error::{LogicError, Result};
pub use handler::ServHandler;
pub use login::{LoginHandler, LogoutHandler};

use mesh::Router;
use std::sync::Arc;
use wire::protocol::{COMMAND_CHAT_USER_TALK, COMMAND_LOGIN_SIGN_IN, COMMAND_LOGIN_SIGN_OUT, SN_LOGIN};

/// Command table for the named service.
pub fn router(service_name: &str) -> Router {
    let mut router = Router::new();
    if service_name == SN_LOGIN {
        router
            .handle(COMMAND_LOGIN_SIGN_IN, Arc::new(LoginHandler))
            .handle(COMMAND_LOGIN_SIGN_OUT, Arc::new(LogoutHandler));
    } else {
        router.handle(COMMAND_CHAT_USER_TALK, Arc::new(TalkHandler::new()));
    }
    router
}
