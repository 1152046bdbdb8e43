//! Server configuration.

use journaldb_sync_protocol::DEFAULT_CHUNK_SIZE;
use std::net::SocketAddr;
use std::time::Duration;

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 7075;

/// Configuration for the journal server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle time after which an agent sends a heartbeat.
    pub heartbeat_frequency: Duration,
    /// How long an agent waits on a read before checking for shutdown and
    /// heartbeats.
    pub poll_interval: Duration,
    /// Highest journal index a client may bind, inclusive.
    pub max_journal_index: u32,
    /// Bytes read from storage per chunk while sending deltas.
    pub transfer_chunk_size: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 64,
            heartbeat_frequency: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            max_journal_index: 1,
            transfer_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the maximum concurrent connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the heartbeat frequency.
    #[must_use]
    pub fn with_heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.heartbeat_frequency = frequency;
        self
    }

    /// Sets the agent poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the highest journal index a client may bind.
    #[must_use]
    pub fn with_max_journal_index(mut self, max: u32) -> Self {
        self.max_journal_index = max;
        self
    }

    /// Sets the transfer chunk size.
    #[must_use]
    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}
