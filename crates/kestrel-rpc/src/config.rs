//! Centralized configuration for Kestrel RPC.
//!
//! Constants live on [`RpcConfig`]; the client and server take value types
//! seeded from those constants and adjusted with `with_*` builders.

use std::time::Duration;

use crate::client::reconnect::ReconnectConfig;

/// Protocol and runtime limits.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    // Reconnect backoff
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

    // Wire limits
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_PENDING_REQUESTS: usize = 65_536;

    // Server
    pub const MAX_SERVER_CONNECTIONS: usize = 1024;
    pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    // Strategies
    pub const RENDEZVOUS_BUCKETS: usize = 1024;
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Timeout for a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Backoff between reconnect attempts to one endpoint.
    pub reconnect: ReconnectConfig,
    /// In-flight requests per connection before new sends are rejected.
    pub max_pending_requests: usize,
    /// Largest inbound frame accepted.
    pub max_frame_size: usize,
    /// Let `start()` succeed even when no route exists yet.
    pub forced_start: bool,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: RpcConfig::CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            max_pending_requests: RpcConfig::MAX_PENDING_REQUESTS,
            max_frame_size: RpcConfig::MAX_FRAME_SIZE,
            forced_start: false,
        }
    }
}

impl RpcClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_forced_start(mut self, forced: bool) -> Self {
        self.forced_start = forced;
        self
    }
}

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub max_connections: usize,
    pub max_frame_size: usize,
    /// How long `close()` waits for connections to drain before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            max_connections: RpcConfig::MAX_SERVER_CONNECTIONS,
            max_frame_size: RpcConfig::MAX_FRAME_SIZE,
            shutdown_timeout: RpcConfig::SERVER_SHUTDOWN_TIMEOUT,
        }
    }
}

impl RpcServerConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
