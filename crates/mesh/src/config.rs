//! Tunables for servers, outbound clients and the container.

use crate::connection::DEFAULT_MAX_FRAME_SIZE;
use std::time::Duration;

pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(3);
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_WAIT: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Options applied to every channel a server accepts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Deadline for the acceptor handshake (and the WebSocket upgrade).
    pub login_wait: Duration,
    /// Idle read deadline per frame.
    pub read_wait: Duration,
    /// Deadline for one batched write.
    pub write_wait: Duration,
    /// Capacity of each channel's outbound queue.
    pub queue_capacity: usize,
    pub max_frame_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            login_wait: DEFAULT_LOGIN_WAIT,
            read_wait: DEFAULT_READ_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Options for outbound clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Ping interval. Zero disables the heartbeat.
    pub heartbeat: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
    /// Deadline for dial plus handshake.
    pub login_wait: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            read_wait: DEFAULT_READ_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            login_wait: DEFAULT_LOGIN_WAIT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Container options.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// How long a newly discovered instance stays `young` before it is routable.
    pub grace_delay: Duration,
    /// Bound on server shutdown and on waiting for background tasks.
    pub shutdown_timeout: Duration,
    pub client: ClientOptions,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            grace_delay: DEFAULT_GRACE_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            client: ClientOptions::default(),
        }
    }
}
