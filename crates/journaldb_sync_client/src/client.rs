//! Replication client.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::state::{ClientState, SyncCycleResult, SyncStats};
use journaldb_storage::{Journal, JournalKey};
use journaldb_sync_protocol::{
    write_fully, ChannelConsumer, Command, CommandConsumer, CommandProducer, FrameProducer,
    IndexedJournalKey, IntResponseConsumer, JournalClientState, JournalDeltaConsumer,
    ProtocolError, ProtocolResult, StringResponseConsumer, OK,
};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

struct Subscription {
    index: u32,
    remote_key: JournalKey,
    journal: Arc<Journal>,
}

/// Replicates remote journals into local ones.
///
/// Each subscription pairs a journal exported by the server with a local
/// journal of the same schema and gets the next journal index, starting at
/// 0. After [`handshake`](JournalClient::handshake) binds the indexes,
/// every [`sync`](JournalClient::sync) brings all local journals up to the
/// server's committed state.
///
/// The channel is expected to block, with a read timeout so the client can
/// notice a silent server.
///
/// # Example
///
/// ```no_run
/// use journaldb_sync_client::{ClientConfig, JournalClient};
/// # fn example(key: journaldb_storage::JournalKey, local: std::sync::Arc<journaldb_storage::Journal>) -> journaldb_sync_client::ClientResult<()> {
/// let mut client = JournalClient::connect(ClientConfig::default())?;
/// client.subscribe(key, local);
/// client.handshake()?;
/// let result = client.sync()?;
/// println!("received {} rows", result.rows_received);
/// # Ok(())
/// # }
/// ```
pub struct JournalClient<C: Read + Write = TcpStream> {
    config: ClientConfig,
    channel: Option<C>,
    subscriptions: Vec<Subscription>,
    state: ClientState,
    stats: Arc<RwLock<SyncStats>>,
}

impl JournalClient<TcpStream> {
    /// Connects to the configured server.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        let stream = open_stream(&config)?;
        info!(server = %config.server_addr, "connected to journal server");
        Ok(Self::with_channel(config, stream))
    }

    /// Drops the current connection, connects again and re-binds every
    /// subscription.
    pub fn reconnect(&mut self) -> ClientResult<()> {
        self.disconnect();
        let stream = open_stream(&self.config)?;
        self.channel = Some(stream);
        self.state = ClientState::Connected;
        self.stats.write().reconnects += 1;
        info!(server = %self.config.server_addr, "reconnected to journal server");
        self.handshake()
    }
}

impl<C: Read + Write> JournalClient<C> {
    /// Creates a client over an established channel.
    pub fn with_channel(config: ClientConfig, channel: C) -> Self {
        Self {
            config,
            channel: Some(channel),
            subscriptions: Vec::new(),
            state: ClientState::Connected,
            stats: Arc::new(RwLock::new(SyncStats::default())),
        }
    }

    /// Subscribes `local` to the journal the server exports as `remote_key`.
    ///
    /// Returns the journal index. A new subscription takes effect at the
    /// next handshake.
    pub fn subscribe(&mut self, remote_key: JournalKey, local: Arc<Journal>) -> u32 {
        let index = self.subscriptions.len() as u32;
        debug!(index, remote = %remote_key, local = %local.key(), "subscription added");
        self.subscriptions.push(Subscription {
            index,
            remote_key,
            journal: local,
        });
        if self.state.can_start_sync() {
            self.state = ClientState::Connected;
        }
        index
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Shared statistics, readable while the client runs elsewhere.
    pub fn stats_handle(&self) -> Arc<RwLock<SyncStats>> {
        Arc::clone(&self.stats)
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local journal subscribed under `index`.
    pub fn journal(&self, index: u32) -> Option<&Arc<Journal>> {
        self.subscription(index).map(|s| &s.journal)
    }

    /// Remote key subscribed under `index`.
    pub fn remote_key(&self, index: u32) -> Option<&JournalKey> {
        self.subscription(index).map(|s| &s.remote_key)
    }

    /// Number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Closes the connection. Subscriptions are kept.
    pub fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            debug!("connection closed");
        }
        self.state = ClientState::Disconnected;
    }

    /// Binds every subscription with `SET_KEY`.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` with the server's text if a key is refused, for
    /// example `"Not Exported"`. The connection stays usable.
    pub fn handshake(&mut self) -> ClientResult<()> {
        if self.channel.is_none() {
            return Err(ClientError::NotConnected);
        }
        let requests = self
            .subscriptions
            .iter()
            .map(|s| IndexedJournalKey::new(s.index, s.remote_key.clone()).encode())
            .collect::<ProtocolResult<Vec<_>>>()?;

        self.state = ClientState::Connected;
        for (index, payload) in requests.iter().enumerate() {
            if let Err(e) = self.request(Command::SetKey, payload) {
                self.fail(&e);
                return Err(e);
            }
            trace!(index, "journal key accepted");
        }
        self.state = ClientState::Keyed;
        info!(subscriptions = self.subscriptions.len(), "handshake complete");
        Ok(())
    }

    /// Runs one sync cycle.
    ///
    /// Reports the local state of every subscription, then applies the
    /// journal deltas the server pushes until it sends `SERVER_READY`.
    /// Heartbeats are skipped.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` before a successful handshake and `Rejected`
    /// if the server refuses a local state, for example because the local
    /// journal holds rows the server does not have.
    pub fn sync(&mut self) -> ClientResult<SyncCycleResult> {
        if !self.state.can_start_sync() {
            return Err(ClientError::NotConnected);
        }
        let start = Instant::now();
        self.state = ClientState::Syncing;

        let before = self.local_rows();
        match self.run_cycle() {
            Ok(mut result) => {
                result.rows_received = self
                    .local_rows()
                    .iter()
                    .zip(&before)
                    .map(|(after, before)| after.saturating_sub(*before))
                    .sum();
                result.duration = start.elapsed();
                self.state = ClientState::Synced;

                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.deltas_applied += result.updated.len() as u64;
                stats.rows_received += result.rows_received;
                stats.heartbeats += result.heartbeats;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                debug!(
                    journals = result.updated.len(),
                    rows = result.rows_received,
                    elapsed = ?result.duration,
                    "sync cycle complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn run_cycle(&mut self) -> ClientResult<SyncCycleResult> {
        let requests = self
            .subscriptions
            .iter()
            .map(|s| JournalClientState::capture(s.index, &s.journal).encode())
            .collect::<ProtocolResult<Vec<_>>>()?;
        for payload in &requests {
            self.request(Command::DeltaRequest, payload)?;
        }

        let mut result = SyncCycleResult::default();
        let mut rejection = None;
        write_fully(&mut CommandProducer::new(Command::ClientReady), self.channel()?)?;
        loop {
            match self.read_command(&mut result.heartbeats)? {
                Command::ServerReady => break,
                Command::JournalDelta => {
                    let index = self.apply_delta()?;
                    result.updated.push(index);
                }
                Command::StringResponse => {
                    // The server drops a stale state and still finishes the cycle.
                    let reason = self.read_string()?;
                    warn!(%reason, "client state rejected during sync");
                    rejection.get_or_insert(reason);
                }
                found => {
                    return Err(ClientError::UnexpectedCommand {
                        expected: "journal delta",
                        found,
                    })
                }
            }
        }
        match rejection {
            Some(reason) => Err(ClientError::Rejected { reason }),
            None => Ok(result),
        }
    }

    fn apply_delta(&mut self) -> ClientResult<u32> {
        let timeout = self.config.response_timeout;
        let mut index = IntResponseConsumer::new();
        read_until_complete(self.channel()?, &mut index, timeout)?;
        let index = index
            .value()
            .ok_or_else(|| ProtocolError::malformed("journal index missing"))?;
        let unknown = || ProtocolError::malformed(format!("delta for unknown journal index {index}"));
        let index = u32::try_from(index).map_err(|_| unknown())?;
        let journal = self.journal(index).cloned().ok_or_else(unknown)?;

        let mut delta = JournalDeltaConsumer::new(journal, self.config.buffer_size);
        read_until_complete(self.channel()?, &mut delta, timeout)?;
        trace!(index, partitions = delta.applied(), "journal delta applied");
        Ok(index)
    }

    /// Sends a command with a frame payload and expects `"OK"` back.
    fn request(&mut self, command: Command, payload: &[u8]) -> ClientResult<()> {
        let channel = self.channel()?;
        write_fully(&mut CommandProducer::new(command), &mut *channel)?;
        write_fully(&mut FrameProducer::new(payload)?, &mut *channel)?;

        let mut heartbeats = 0;
        let found = self.read_command(&mut heartbeats)?;
        self.stats.write().heartbeats += heartbeats;
        if found != Command::StringResponse {
            return Err(ClientError::UnexpectedCommand {
                expected: "string response",
                found,
            });
        }

        let text = self.read_string()?;
        if text == OK {
            Ok(())
        } else {
            warn!(%command, reason = %text, "request rejected");
            Err(ClientError::Rejected { reason: text })
        }
    }

    fn read_string(&mut self) -> ClientResult<String> {
        let timeout = self.config.response_timeout;
        let mut response = StringResponseConsumer::new();
        read_until_complete(self.channel()?, &mut response, timeout)?;
        Ok(response.value()?.unwrap_or_default())
    }

    /// Reads the next command tag, skipping heartbeats.
    fn read_command(&mut self, heartbeats: &mut u64) -> ClientResult<Command> {
        let timeout = self.config.response_timeout;
        let channel = self.channel()?;
        loop {
            let mut consumer = CommandConsumer::new();
            read_until_complete(&mut *channel, &mut consumer, timeout)?;
            let command = consumer
                .command()
                .ok_or_else(|| ProtocolError::malformed("incomplete command tag"))??;
            if command == Command::ServerHeartbeat {
                trace!("heartbeat");
                *heartbeats += 1;
                continue;
            }
            return Ok(command);
        }
    }

    fn channel(&mut self) -> ClientResult<&mut C> {
        self.channel.as_mut().ok_or(ClientError::NotConnected)
    }

    fn subscription(&self, index: u32) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.index == index)
    }

    fn local_rows(&self) -> Vec<u64> {
        self.subscriptions.iter().map(|s| s.journal.size()).collect()
    }

    fn fail(&mut self, error: &ClientError) {
        self.stats.write().last_error = Some(error.to_string());
        match error {
            ClientError::Rejected { .. } => {
                // The server keeps the connection open after a rejection.
                if self.state == ClientState::Syncing {
                    self.state = ClientState::Keyed;
                }
            }
            _ => {
                warn!(error = %error, "connection failed");
                self.channel = None;
                self.state = ClientState::Error;
            }
        }
    }
}

fn open_stream(config: &ClientConfig) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&config.server_addr, config.connect_timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.read_timeout))?;
    stream.set_write_timeout(Some(config.response_timeout))?;
    Ok(stream)
}

/// Reads until `consumer` is complete, giving up once the channel has
/// been silent for `timeout`.
fn read_until_complete<R, T>(channel: &mut R, consumer: &mut T, timeout: Duration) -> ClientResult<()>
where
    R: Read,
    T: ChannelConsumer + ?Sized,
{
    let mut deadline = Instant::now() + timeout;
    loop {
        let mut counted = CountingReader::new(&mut *channel);
        consumer.read(&mut counted)?;
        if consumer.is_complete() {
            return Ok(());
        }
        let now = Instant::now();
        if counted.bytes > 0 {
            deadline = now + timeout;
        } else if now >= deadline {
            return Err(ClientError::Timeout(timeout));
        }
    }
}

/// Counts the bytes read through it.
struct CountingReader<'a, R> {
    inner: &'a mut R,
    bytes: usize,
}

impl<'a, R: Read> CountingReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner, bytes: 0 }
    }
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes += n;
        Ok(n)
    }
}
