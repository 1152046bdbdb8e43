//! Background replication on the tokio blocking pool.

use crate::client::JournalClient;
use crate::error::{ClientError, ClientResult};
use crate::state::{ClientState, SyncCycleResult, SyncStats};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often a waiting replication loop checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Progress reported by a background replication loop.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync cycle completed.
    Synced(SyncCycleResult),
    /// A cycle failed with a transient error and will be retried.
    Retrying {
        /// Retry number, starting at 1.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
        /// Error that caused the retry.
        error: String,
    },
    /// The loop gave up.
    Failed {
        /// Error that ended the loop.
        error: String,
    },
}

/// Handle to a running replication loop.
///
/// Dropping the handle, or calling [`stop`](Replication::stop), cancels the
/// loop after its current cycle.
pub struct Replication {
    events: mpsc::Receiver<SyncEvent>,
    stats: Arc<RwLock<SyncStats>>,
    task: JoinHandle<ClientResult<JournalClient>>,
}

impl Replication {
    /// Waits for the next event. Returns `None` once the loop has ended
    /// and every event was received.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Snapshot of the client statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true once the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and returns the client.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop if it gave up before being
    /// cancelled.
    pub async fn stop(self) -> ClientResult<JournalClient> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| ClientError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

/// Runs sync cycles every `interval` until cancelled.
///
/// Events go through a channel holding at most `capacity` of them; when it
/// is full the loop waits for the receiver before starting the next cycle.
/// Retryable errors reconnect and re-bind with the backoff in the client's
/// [`RetryConfig`](crate::RetryConfig); anything else, or running out of
/// attempts, ends the loop with [`SyncEvent::Failed`].
///
/// Must be called from within a tokio runtime.
pub fn spawn_replication(client: JournalClient, interval: Duration, capacity: usize) -> Replication {
    let (tx, events) = mpsc::channel(capacity.max(1));
    let stats = client.stats_handle();
    let task = tokio::task::spawn_blocking(move || replicate(client, interval, &tx));
    Replication {
        events,
        stats,
        task,
    }
}

fn replicate(
    mut client: JournalClient,
    interval: Duration,
    events: &mpsc::Sender<SyncEvent>,
) -> ClientResult<JournalClient> {
    let retry = client.config().retry.clone();
    info!(journals = client.subscription_count(), ?interval, "replication started");
    let mut attempt = 0u32;
    loop {
        if events.is_closed() {
            info!("replication cancelled");
            return Ok(client);
        }

        let (event, wait) = match prepare(&mut client).and_then(|()| client.sync()) {
            Ok(result) => {
                attempt = 0;
                (SyncEvent::Synced(result), interval)
            }
            Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %e, "sync failed, retrying");
                let event = SyncEvent::Retrying {
                    attempt,
                    delay,
                    error: e.to_string(),
                };
                (event, delay)
            }
            Err(e) => {
                error!(error = %e, "replication stopped");
                let _ = events.blocking_send(SyncEvent::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        if events.blocking_send(event).is_err() || !wait_unless_cancelled(events, wait) {
            info!("replication cancelled");
            return Ok(client);
        }
    }
}

/// Brings the client to a state where it can sync.
fn prepare(client: &mut JournalClient) -> ClientResult<()> {
    match client.state() {
        ClientState::Keyed | ClientState::Synced => Ok(()),
        ClientState::Connected => client.handshake(),
        ClientState::Disconnected | ClientState::Error | ClientState::Syncing => {
            debug!("reconnecting");
            client.reconnect()
        }
    }
}

/// Sleeps for `duration`. Returns false if the receiver went away first.
fn wait_unless_cancelled<T>(events: &mpsc::Sender<T>, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if events.is_closed() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_early_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel::<()>(1);
        drop(rx);
        let start = Instant::now();
        assert!(!wait_unless_cancelled(&tx, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_runs_to_deadline() {
        let (tx, _rx) = mpsc::channel::<()>(1);
        let start = Instant::now();
        assert!(wait_unless_cancelled(&tx, Duration::from_millis(60)));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
