//! Client state machine and statistics.

use std::time::{Duration, Instant};

/// Where a client is in its conversation with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection.
    Disconnected,
    /// Connected, no journal bound yet.
    Connected,
    /// All subscriptions bound with `SET_KEY`.
    Keyed,
    /// A sync cycle is in progress.
    Syncing,
    /// The last sync cycle completed.
    Synced,
    /// The last operation failed; the connection must be re-established.
    Error,
}

impl ClientState {
    /// Returns true while a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, ClientState::Syncing)
    }

    /// Returns true if a sync cycle can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, ClientState::Keyed | ClientState::Synced)
    }

    /// Returns true if a connection is open and usable.
    pub fn is_connected(&self) -> bool {
        !matches!(self, ClientState::Disconnected | ClientState::Error)
    }
}

/// Cumulative statistics over a client's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync cycles completed.
    pub cycles_completed: u64,
    /// Journal deltas applied.
    pub deltas_applied: u64,
    /// Rows received over all journals.
    pub rows_received: u64,
    /// Heartbeats seen.
    pub heartbeats: u64,
    /// Reconnects after a failure.
    pub reconnects: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Indexes of the journals that received a delta, in arrival order.
    pub updated: Vec<u32>,
    /// Rows received in this cycle over all journals.
    pub rows_received: u64,
    /// Heartbeats skipped while waiting.
    pub heartbeats: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if the server had nothing new.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_allowed_only_when_keyed() {
        assert!(!ClientState::Disconnected.can_start_sync());
        assert!(!ClientState::Connected.can_start_sync());
        assert!(ClientState::Keyed.can_start_sync());
        assert!(ClientState::Synced.can_start_sync());
        assert!(!ClientState::Syncing.can_start_sync());
        assert!(!ClientState::Error.can_start_sync());
    }

    #[test]
    fn connection_states() {
        assert!(ClientState::Syncing.is_active());
        assert!(ClientState::Connected.is_connected());
        assert!(!ClientState::Error.is_connected());
        assert!(SyncCycleResult::default().is_empty());
    }
}
