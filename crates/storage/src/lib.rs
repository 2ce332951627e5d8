//! Session storage backends.
//!
//! `RedisStorage` keeps two keys per login:
//!
//! ```text
//! login:sn:{channel_id}  -> Session JSON
//! login:loc:{account}    -> Location bytes
//! ```
//!
//! Both expire after 48 hours.

pub mod error;
pub mod redis_storage;

pub use error::{Error, Result};
pub use redis_storage::{RedisStorage, LOCATION_KEY_PREFIX, SESSION_KEY_PREFIX, SESSION_TTL_SECS};
