//! Service discovery backed by Consul's HTTP API.
//!
//! # Example
//!
//! ```ignore
//! use naming::ConsulNaming;
//!
//! let naming = Arc::new(ConsulNaming::new("http://localhost:8500"));
//! container.set_naming(naming);
//! ```

pub mod consul;
pub mod error;

pub use consul::{ConsulNaming, KEY_HEALTH_URL, KEY_PROTOCOL};
pub use error::{Error, Result};
