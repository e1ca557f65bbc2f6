//! Centralized configuration for remex.
//!
//! Protocol and timing constants live on `IpcConfig`. Per-server settings are
//! carried by an explicitly constructed `ServerConfig` value.

use std::time::Duration;

use crate::ipc::transport::Endpoint;

/// Protocol-level constants shared by client and server.
pub struct IpcConfig;

impl IpcConfig {
    /// Highest command envelope version this build understands.
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Largest frame payload accepted from a peer.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a closing proxy waits for the server's acknowledgement.
    pub const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
    pub const MAX_CONNECTIONS: usize = 256;
    pub const SOCKET_FILE_PREFIX: &'static str = "remex-";
    pub const LOCAL_HOST: &'static str = ".";
}

/// Settings for one remote execution server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where the server listens.
    pub endpoint: Endpoint,
    /// Connections beyond this count are accepted and immediately dropped.
    pub max_connections: usize,
    /// Upper bound on waiting for connection tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_connections: IpcConfig::MAX_CONNECTIONS,
            shutdown_timeout: IpcConfig::SHUTDOWN_TIMEOUT,
        }
    }

    /// A local named server with a randomly generated name.
    pub fn unique() -> Self {
        Self::new(Endpoint::named(uuid::Uuid::new_v4().to_string()))
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
