//! Per-connection command processing.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::exports::ExportRegistry;
use bytes::Bytes;
use journaldb_storage::{Journal, JournalKey};
use journaldb_sync_protocol::{
    write_fully, ChannelConsumer, ChannelProducer, Command, CommandConsumer, CommandProducer,
    FrameConsumer, IndexedJournalKey, IntResponseProducer, JournalClientState,
    JournalDeltaProducer, ProtocolError, StringResponseProducer, OK,
};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Reply to a key bound to an unexported journal.
pub const NOT_EXPORTED: &str = "Not Exported";

/// Reply to a delta request for an index that was never bound.
pub const INDEX_NOT_BOUND: &str = "Journal index does not match key request";

/// Where an agent is in its conversation with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No journal bound yet.
    Idle,
    /// At least one journal bound.
    Keyed,
    /// A client state is waiting for `CLIENT_READY`.
    DeltaReady,
}

struct Binding {
    key: JournalKey,
    producer: JournalDeltaProducer,
    state: Option<JournalClientState>,
}

/// Serves one client connection.
///
/// Commands are handled one at a time. Reading a command is resumable: if
/// the channel runs dry mid-command, [`ServerAgent::process`] returns and
/// picks up where it left off on the next call. Responses are written in
/// full before the next command is read.
pub struct ServerAgent {
    exports: Arc<ExportRegistry>,
    config: ServerConfig,
    peer: Option<SocketAddr>,
    state: AgentState,
    bindings: BTreeMap<u32, Binding>,
    command: CommandConsumer,
    frame: FrameConsumer,
    pending: Option<Command>,
}

impl ServerAgent {
    /// Creates an agent serving `exports`.
    pub fn new(exports: Arc<ExportRegistry>, config: ServerConfig, peer: Option<SocketAddr>) -> Self {
        Self {
            exports,
            config,
            peer,
            state: AgentState::Idle,
            bindings: BTreeMap::new(),
            command: CommandConsumer::new(),
            frame: FrameConsumer::new(),
            pending: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Key bound to `index`, if any.
    pub fn bound_key(&self, index: u32) -> Option<&JournalKey> {
        self.bindings.get(&index).map(|b| &b.key)
    }

    /// Returns true if no command is partially read.
    pub fn is_between_messages(&self) -> bool {
        self.pending.is_none() && !self.command.is_started()
    }

    /// Reads and handles at most one command.
    ///
    /// Returns `Ok(true)` if a command was handled, `Ok(false)` if the
    /// channel ran out of data first.
    pub fn process<C: Read + Write>(&mut self, channel: &mut C) -> ServerResult<bool> {
        let command = match self.pending {
            Some(command) => command,
            None => {
                self.command.read(channel)?;
                let Some(result) = self.command.command() else {
                    return Ok(false);
                };
                self.command.reset();
                match result {
                    Ok(command) => command,
                    Err(ProtocolError::UnknownCommand(code)) => {
                        warn!(peer = ?self.peer, code, "unknown command");
                        reply(channel, &format!("Unknown command: {code}"))?;
                        return Ok(true);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        self.pending = Some(command);
        trace!(peer = ?self.peer, %command, "processing command");

        match command {
            Command::SetKey => {
                let Some(payload) = self.read_frame(channel)? else {
                    return Ok(false);
                };
                self.set_key(channel, &payload)?;
            }
            Command::DeltaRequest => {
                let Some(payload) = self.read_frame(channel)? else {
                    return Ok(false);
                };
                self.delta_request(channel, &payload)?;
            }
            Command::ClientReady => self.push_deltas(channel)?,
            other => {
                warn!(peer = ?self.peer, %other, "client sent a server command");
                reply(channel, &format!("Unknown command: {}", other.code()))?;
            }
        }
        self.pending = None;
        Ok(true)
    }

    /// Serves the connection until the client disconnects or `shutdown`
    /// turns true.
    ///
    /// Sends a heartbeat whenever nothing was written for the configured
    /// heartbeat frequency, but never in the middle of a message.
    pub fn run<C: Read + Write>(
        &mut self,
        channel: &mut C,
        shutdown: &watch::Receiver<bool>,
    ) -> ServerResult<()> {
        info!(peer = ?self.peer, "agent started");
        let mut last_write = Instant::now();
        loop {
            if *shutdown.borrow() {
                info!(peer = ?self.peer, "agent stopping on shutdown");
                return Ok(());
            }
            let result = match self.process(channel) {
                Ok(true) => {
                    last_write = Instant::now();
                    Ok(())
                }
                Ok(false)
                    if self.is_between_messages()
                        && last_write.elapsed() >= self.config.heartbeat_frequency =>
                {
                    trace!(peer = ?self.peer, "heartbeat");
                    last_write = Instant::now();
                    write_fully(&mut CommandProducer::new(Command::ServerHeartbeat), channel)
                        .map_err(ServerError::from)
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    info!(peer = ?self.peer, "client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(peer = ?self.peer, error = %e, "agent failed");
                    return Err(e);
                }
            }
        }
    }

    fn read_frame<C: Read>(&mut self, channel: &mut C) -> ServerResult<Option<Bytes>> {
        self.frame.read(channel)?;
        let payload = self.frame.take_payload();
        if payload.is_some() {
            self.frame.reset();
        }
        Ok(payload)
    }

    fn set_key<C: Write>(&mut self, channel: &mut C, payload: &[u8]) -> ServerResult<()> {
        let request = match IndexedJournalKey::decode(payload) {
            Ok(request) => request,
            Err(e) => return reply(channel, &e.to_string()),
        };
        let max = self.config.max_journal_index;
        if request.index > max {
            return reply(channel, &format!("Journal index is too large. Max {max}"));
        }
        let Some(journal) = self.exports.get(&request.key) else {
            debug!(peer = ?self.peer, key = %request.key, "key not exported");
            return reply(channel, NOT_EXPORTED);
        };

        info!(peer = ?self.peer, index = request.index, key = %request.key, "bound journal");
        self.bind(request.index, request.key, journal);
        reply(channel, OK)
    }

    fn bind(&mut self, index: u32, key: JournalKey, journal: Arc<Journal>) {
        let producer = JournalDeltaProducer::new(journal, self.config.transfer_chunk_size);
        self.bindings.insert(
            index,
            Binding {
                key,
                producer,
                state: None,
            },
        );
        if self.state == AgentState::Idle {
            self.state = AgentState::Keyed;
        }
    }

    fn delta_request<C: Write>(&mut self, channel: &mut C, payload: &[u8]) -> ServerResult<()> {
        let state = match JournalClientState::decode(payload) {
            Ok(state) => state,
            Err(e) => return reply(channel, &e.to_string()),
        };
        let Some(binding) = self.bindings.get_mut(&state.journal_index) else {
            return reply(channel, INDEX_NOT_BOUND);
        };
        if let Err(e) = binding.producer.validate(&state) {
            warn!(peer = ?self.peer, index = state.journal_index, error = %e, "inconsistent client state");
            return reply(channel, &e.to_string());
        }

        debug!(
            peer = ?self.peer,
            index = state.journal_index,
            rows = state.total_rows(),
            "client state received"
        );
        binding.state = Some(state);
        self.state = AgentState::DeltaReady;
        reply(channel, OK)
    }

    fn push_deltas<C: Write>(&mut self, channel: &mut C) -> ServerResult<()> {
        for (index, binding) in &mut self.bindings {
            let Some(state) = binding.state.as_ref() else {
                continue;
            };
            match binding.producer.configure(state) {
                Ok(()) => {}
                Err(ProtocolError::Consistency(e)) => {
                    warn!(peer = ?self.peer, index, error = %e, "client state went stale");
                    binding.state = None;
                    reply(channel, &e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if !binding.producer.has_content() {
                continue;
            }

            write_fully(&mut CommandProducer::new(Command::JournalDelta), channel)?;
            write_fully(&mut IntResponseProducer::new(*index as i32), channel)?;
            write_fully(&mut binding.producer, channel)?;
            binding.state = binding.producer.projected_state().cloned();
            debug!(
                peer = ?self.peer,
                index,
                rows = binding.state.as_ref().map_or(0, JournalClientState::total_rows),
                "sent journal delta"
            );
        }
        write_fully(&mut CommandProducer::new(Command::ServerReady), channel)?;
        if self.state == AgentState::DeltaReady {
            self.state = AgentState::Keyed;
        }
        Ok(())
    }
}

fn reply<C: Write>(channel: &mut C, text: &str) -> ServerResult<()> {
    write_fully(&mut CommandProducer::new(Command::StringResponse), channel)?;
    write_fully(&mut StringResponseProducer::new(text)?, channel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use journaldb_storage::PartitionType;
    use journaldb_sync_protocol::{
        FrameProducer, IntResponseConsumer, JournalDeltaConsumer, StringResponseConsumer,
    };
    use journaldb_testkit::{fixtures, MockChannel};

    struct Harness {
        agent: ServerAgent,
        server_end: MockChannel,
        client_end: MockChannel,
        journal: Arc<Journal>,
    }

    impl Harness {
        fn new() -> Self {
            let exports = Arc::new(ExportRegistry::new());
            let journal = fixtures::quote_journal();
            exports.export(journal.clone()).unwrap();
            let (client_end, server_end) = MockChannel::pair();
            Self {
                agent: ServerAgent::new(exports, ServerConfig::default(), None),
                server_end,
                client_end,
                journal,
            }
        }

        fn send(&mut self, command: Command, payload: Option<Vec<u8>>) {
            CommandProducer::new(command)
                .write(&mut self.client_end)
                .unwrap();
            if let Some(payload) = payload {
                FrameProducer::new(&payload)
                    .unwrap()
                    .write(&mut self.client_end)
                    .unwrap();
            }
            assert!(self.agent.process(&mut self.server_end).unwrap());
        }

        fn set_key(&mut self, index: u32, key: JournalKey) -> String {
            let payload = IndexedJournalKey::new(index, key).encode().unwrap();
            self.send(Command::SetKey, Some(payload));
            self.string_response()
        }

        fn delta_request(&mut self, state: &JournalClientState) -> String {
            self.send(Command::DeltaRequest, Some(state.encode().unwrap()));
            self.string_response()
        }

        fn command(&mut self) -> Command {
            let mut consumer = CommandConsumer::new();
            consumer.read(&mut self.client_end).unwrap();
            consumer.command().unwrap().unwrap()
        }

        fn string_response(&mut self) -> String {
            assert_eq!(self.command(), Command::StringResponse);
            let mut consumer = StringResponseConsumer::new();
            consumer.read(&mut self.client_end).unwrap();
            assert!(consumer.is_complete());
            consumer.value().unwrap().unwrap()
        }
    }

    #[test]
    fn set_key_request_response() {
        let mut h = Harness::new();
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert_eq!(h.set_key(0, fixtures::quote_key()), "OK");
        assert_eq!(h.agent.state(), AgentState::Keyed);
        assert_eq!(h.agent.bound_key(0), Some(&fixtures::quote_key()));

        let trade = JournalKey::new("trade", PartitionType::Day);
        assert_eq!(h.set_key(0, trade), "Not Exported");
        assert_eq!(h.agent.bound_key(0), Some(&fixtures::quote_key()));
    }

    #[test]
    fn journal_index_correctness() {
        let mut h = Harness::new();
        assert_eq!(
            h.set_key(3, fixtures::quote_key()),
            "Journal index is too large. Max 1"
        );
        assert_eq!(h.set_key(0, fixtures::quote_key()), "OK");
        assert_eq!(
            h.delta_request(&JournalClientState::empty(1)),
            "Journal index does not match key request"
        );
        assert_eq!(h.delta_request(&JournalClientState::empty(0)), "OK");
        assert_eq!(h.agent.state(), AgentState::DeltaReady);
    }

    #[test]
    fn max_index_is_inclusive() {
        let mut h = Harness::new();
        assert_eq!(h.set_key(1, fixtures::quote_key()), "OK");
        assert_eq!(h.set_key(2, fixtures::quote_key()), "Journal index is too large. Max 1");
    }

    #[test]
    fn inconsistent_state_is_rejected_with_reason() {
        let mut h = Harness::new();
        h.set_key(0, fixtures::quote_key());
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&client, 0, 5);
        client.commit().unwrap();

        let reply = h.delta_request(&JournalClientState::capture(0, &client));
        assert_eq!(reply, "client has 1 partitions, server has 0");
        assert_eq!(h.agent.state(), AgentState::Keyed);
    }

    #[test]
    fn delta_request_before_set_key_stays_idle() {
        let mut h = Harness::new();
        assert_eq!(h.delta_request(&JournalClientState::empty(0)), INDEX_NOT_BOUND);
        assert_eq!(h.agent.state(), AgentState::Idle);
        assert!(h.agent.bound_key(0).is_none());
    }

    #[test]
    fn stale_state_at_client_ready_is_reported() {
        let mut h = Harness::new();
        h.set_key(0, fixtures::quote_key());
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&client, 0, 5);
        client.commit().unwrap();
        h.agent.bindings.get_mut(&0).unwrap().state = Some(JournalClientState::capture(0, &client));
        h.agent.state = AgentState::DeltaReady;

        h.send(Command::ClientReady, None);
        assert_eq!(h.string_response(), "client has 1 partitions, server has 0");
        assert_eq!(h.command(), Command::ServerReady);
        assert_eq!(h.agent.state(), AgentState::Keyed);

        // The stale state was dropped, so the next cycle is empty.
        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::ServerReady);
    }

    #[test]
    fn unknown_command_keeps_connection_open() {
        let mut h = Harness::new();
        h.client_end.write_all(&[journaldb_sync_protocol::MAGIC, 0x2A]).unwrap();
        assert!(h.agent.process(&mut h.server_end).unwrap());
        assert_eq!(h.string_response(), "Unknown command: 42");

        assert_eq!(h.set_key(0, fixtures::quote_key()), "OK");
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut h = Harness::new();
        h.client_end.write_all(&[0x00, 0x01]).unwrap();
        assert!(h.agent.process(&mut h.server_end).is_err());
    }

    #[test]
    fn command_split_across_calls() {
        let mut h = Harness::new();
        let payload = IndexedJournalKey::new(0, fixtures::quote_key())
            .encode()
            .unwrap();
        let mut bytes = Command::SetKey.tag().to_vec();
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&payload);

        let (head, tail) = bytes.split_at(5);
        h.client_end.write_all(head).unwrap();
        assert!(!h.agent.process(&mut h.server_end).unwrap());
        assert!(!h.agent.is_between_messages());
        h.client_end.write_all(tail).unwrap();
        assert!(h.agent.process(&mut h.server_end).unwrap());
        assert!(h.agent.is_between_messages());
        assert_eq!(h.string_response(), "OK");
    }

    #[test]
    fn client_ready_without_bindings_sends_server_ready() {
        let mut h = Harness::new();
        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::ServerReady);
    }

    #[test]
    fn incremental_interaction() {
        let mut h = Harness::new();
        let client = fixtures::quote_journal();
        let mut consumer = JournalDeltaConsumer::new(client.clone(), 1024);

        assert_eq!(h.set_key(0, fixtures::quote_key()), "OK");
        assert_eq!(
            h.delta_request(&JournalClientState::capture(0, &client)),
            "OK"
        );

        fixtures::append_quotes(&h.journal, 0, 100);
        h.journal.commit().unwrap();

        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::JournalDelta);
        let mut index = IntResponseConsumer::new();
        index.read(&mut h.client_end).unwrap();
        assert_eq!(index.value(), Some(0));
        consumer.read(&mut h.client_end).unwrap();
        assert!(consumer.is_complete());
        assert_eq!(client.size(), 100);
        assert_eq!(h.command(), Command::ServerReady);

        fixtures::append_quotes(&h.journal, 100, 100);
        h.journal.commit().unwrap();
        assert_eq!(
            h.delta_request(&JournalClientState::capture(0, &client)),
            "OK"
        );

        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::JournalDelta);
        index.reset();
        index.read(&mut h.client_end).unwrap();
        assert_eq!(index.value(), Some(0));
        consumer.reset();
        consumer.read(&mut h.client_end).unwrap();
        assert!(consumer.is_complete());
        assert_eq!(client.size(), 200);
        assert_eq!(h.command(), Command::ServerReady);
        fixtures::assert_same_rows(&h.journal, &client);
    }

    #[test]
    fn stored_state_advances_without_new_request() {
        let mut h = Harness::new();
        let client = fixtures::quote_journal();
        h.set_key(0, fixtures::quote_key());
        h.delta_request(&JournalClientState::empty(0));
        fixtures::append_quotes(&h.journal, 0, 10);
        h.journal.commit().unwrap();

        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::JournalDelta);
        let mut index = IntResponseConsumer::new();
        index.read(&mut h.client_end).unwrap();
        let mut consumer = JournalDeltaConsumer::new(client.clone(), 1024);
        consumer.read(&mut h.client_end).unwrap();
        assert_eq!(h.command(), Command::ServerReady);

        // Nothing new: the projected state is up to date, so no delta.
        h.send(Command::ClientReady, None);
        assert_eq!(h.command(), Command::ServerReady);
        assert_eq!(client.size(), 10);
    }

    #[test]
    fn run_sends_heartbeats_and_stops_on_disconnect() {
        let exports = Arc::new(ExportRegistry::new());
        let config = ServerConfig::default()
            .with_heartbeat_frequency(std::time::Duration::from_millis(1));
        let (mut client_end, mut server_end) = MockChannel::pair();
        let (_tx, rx) = watch::channel(false);

        let handle = std::thread::spawn(move || {
            let mut agent = ServerAgent::new(exports, config, None);
            agent.run(&mut server_end, &rx)
        });

        let mut consumer = CommandConsumer::new();
        loop {
            consumer.read(&mut client_end).unwrap();
            if consumer.is_complete() {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(consumer.command().unwrap().unwrap(), Command::ServerHeartbeat);

        client_end.close();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn run_stops_on_shutdown() {
        let exports = Arc::new(ExportRegistry::new());
        let (_client_end, mut server_end) = MockChannel::pair();
        let (tx, rx) = watch::channel(false);

        let handle = std::thread::spawn(move || {
            let mut agent = ServerAgent::new(exports, ServerConfig::default(), None);
            agent.run(&mut server_end, &rx)
        });
        tx.send(true).unwrap();
        handle.join().unwrap().unwrap();
    }
}
