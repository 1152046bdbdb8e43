//! Journal deltas: everything a client is missing of one journal.
//!
//! ```text
//! [u32 partition count] then that many partition deltas
//! ```
//!
//! Only partitions with new rows are sent. They start at the client's last
//! partition, which may have grown, and continue through partitions the
//! client has never seen.

use crate::channel::{ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::error::{ConsistencyError, ProtocolResult};
use crate::messages::{JournalClientState, PartitionState};
use crate::partition_delta::{PartitionDeltaConsumer, PartitionDeltaProducer};
use bytes::Buf;
use journaldb_storage::Journal;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

const HEADER_LEN: usize = 4;

/// Streams the rows and symbols a client is missing of a journal.
pub struct JournalDeltaProducer {
    journal: Arc<Journal>,
    chunk_size: usize,
    header: OutBuffer,
    partitions: Vec<PartitionDeltaProducer>,
    position: usize,
    projected: Option<JournalClientState>,
}

impl JournalDeltaProducer {
    /// Creates a producer for `journal`, reading storage in chunks of
    /// `chunk_size` bytes.
    pub fn new(journal: Arc<Journal>, chunk_size: usize) -> Self {
        Self {
            journal,
            chunk_size,
            header: OutBuffer::default(),
            partitions: Vec::new(),
            position: 0,
            projected: None,
        }
    }

    /// The journal being sent.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Checks that `state` could have been produced by replicating this
    /// journal.
    ///
    /// An empty `symbol_counts` stands for a client holding no symbols.
    pub fn validate(&self, state: &JournalClientState) -> Result<(), ConsistencyError> {
        let partitions = self.journal.partitions();
        if state.partitions.len() > partitions.len() {
            return Err(ConsistencyError::ClientAhead {
                client: state.partitions.len(),
                server: partitions.len(),
            });
        }
        for (index, (client, server)) in state.partitions.iter().zip(&partitions).enumerate() {
            if client.bucket != server.bucket() {
                return Err(ConsistencyError::BucketMismatch {
                    partition: index,
                    client: client.bucket,
                    server: server.bucket(),
                });
            }
            if client.rows > server.row_count() {
                return Err(ConsistencyError::RowsAhead {
                    partition: index,
                    client: client.rows,
                    server: server.row_count(),
                });
            }
        }

        let tables = self.journal.symbol_tables();
        if !state.symbol_counts.is_empty() && state.symbol_counts.len() != tables.len() {
            return Err(ConsistencyError::SymbolColumns {
                client: state.symbol_counts.len(),
                server: tables.len(),
            });
        }
        for (table, (client, server)) in state.symbol_counts.iter().zip(&tables).enumerate() {
            if *client > server.len() {
                return Err(ConsistencyError::SymbolTableAhead {
                    table,
                    client: *client,
                    server: server.len(),
                });
            }
        }
        Ok(())
    }

    /// Prepares the delta for a client in `state`.
    ///
    /// Row counts are snapshotted before symbol counts, so the symbols sent
    /// cover every row sent. Symbol entries ride in the first partition
    /// delta; later ones carry empty symbol sections.
    pub fn configure(&mut self, state: &JournalClientState) -> ProtocolResult<()> {
        self.validate(state)?;

        let tables = self.journal.symbol_tables();
        let start = state.partitions.len().saturating_sub(1);
        let mut deltas = Vec::new();
        for partition in self.journal.partitions().into_iter().skip(start) {
            let receiver_rows = state.rows_of(partition.index());
            let mut delta = PartitionDeltaProducer::new(partition, &tables, self.chunk_size)?;
            delta.configure_rows(receiver_rows)?;
            if delta.has_content() {
                deltas.push(delta);
            }
        }

        let targets: Vec<u64> = tables.iter().map(|t| t.len()).collect();
        let mut projected = state.clone();
        if let Some(first) = deltas.first_mut() {
            let ranges: Vec<(u64, u64)> = targets
                .iter()
                .enumerate()
                .map(|(table, to)| (state.symbols_of(table), *to))
                .collect();
            first.configure_symbols(&ranges);
            projected.symbol_counts = targets;
        }
        for delta in &deltas {
            let index = delta.partition().index();
            let next = PartitionState {
                bucket: delta.partition().bucket(),
                rows: delta.row_to(),
            };
            match projected.partitions.get_mut(index) {
                Some(existing) => *existing = next,
                None => projected.partitions.push(next),
            }
        }

        debug!(
            journal = %self.journal.key(),
            partitions = deltas.len(),
            client_rows = state.total_rows(),
            target_rows = projected.total_rows(),
            "configured journal delta"
        );
        self.header = OutBuffer::new((deltas.len() as u32).to_be_bytes().to_vec());
        self.partitions = deltas;
        self.position = 0;
        self.projected = Some(projected);
        Ok(())
    }

    /// The state the client will be in after applying the delta.
    #[must_use]
    pub fn projected_state(&self) -> Option<&JournalClientState> {
        self.projected.as_ref()
    }
}

impl ChannelProducer for JournalDeltaProducer {
    fn has_content(&self) -> bool {
        !self.partitions.is_empty()
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        if !self.header.drain(channel)? {
            return Ok(false);
        }
        while let Some(partition) = self.partitions.get_mut(self.position) {
            if !partition.write(channel)? {
                return Ok(false);
            }
            self.position += 1;
        }
        Ok(true)
    }
}

/// Applies a journal delta to a local journal, partition by partition.
pub struct JournalDeltaConsumer {
    header: InBuffer,
    count: Option<u32>,
    applied: u32,
    partition: PartitionDeltaConsumer,
}

impl JournalDeltaConsumer {
    /// Creates a consumer writing into `journal`.
    pub fn new(journal: Arc<Journal>, buffer_size: usize) -> Self {
        Self {
            header: InBuffer::new(HEADER_LEN),
            count: None,
            applied: 0,
            partition: PartitionDeltaConsumer::new(journal, buffer_size),
        }
    }

    /// Partition deltas applied so far.
    #[must_use]
    pub fn applied(&self) -> u32 {
        self.applied
    }
}

impl ChannelConsumer for JournalDeltaConsumer {
    fn reset(&mut self) {
        self.header.expect(HEADER_LEN);
        self.count = None;
        self.applied = 0;
        self.partition.reset();
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        let count = match self.count {
            Some(count) => count,
            None => {
                if !self.header.fill(channel)? {
                    return Ok(());
                }
                let count = self.header.take().get_u32();
                self.count = Some(count);
                count
            }
        };
        while self.applied < count {
            self.partition.read(channel)?;
            if !self.partition.is_complete() {
                return Ok(());
            }
            self.applied += 1;
            self.partition.reset();
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.count == Some(self.applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use journaldb_testkit::generators::{write_schedule_strategy, PropTestConfig};
    use journaldb_testkit::{fixtures, MockChannel};
    use proptest::prelude::*;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn replicate(server: &Arc<Journal>, client: &Arc<Journal>) -> JournalClientState {
        let state = JournalClientState::capture(0, client);
        let mut producer = JournalDeltaProducer::new(server.clone(), 100);
        producer.configure(&state).unwrap();
        let projected = producer.projected_state().cloned().unwrap();

        let mut channel = MockChannel::new()
            .with_max_write(37)
            .with_max_read(19)
            .with_blocking_reads(false);
        let mut consumer = JournalDeltaConsumer::new(client.clone(), 64);
        let mut spins = 0;
        while !consumer.is_complete() {
            producer.write(&mut channel).unwrap();
            channel.loopback();
            consumer.read(&mut channel).unwrap();
            spins += 1;
            assert!(spins < 100_000);
        }
        projected
    }

    #[test]
    fn replicates_across_partitions() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes_every(&server, 0, 300, DAY / 100);
        server.commit().unwrap();

        let projected = replicate(&server, &client);
        assert_eq!(server.partition_count(), 3);
        assert_eq!(client.partition_count(), 3);
        assert_eq!(projected, JournalClientState::capture(0, &client));
        fixtures::assert_same_rows(&server, &client);
    }

    #[test]
    fn grows_last_partition_then_adds_new_ones() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes_every(&server, 0, 50, DAY / 100);
        server.commit().unwrap();
        replicate(&server, &client);
        assert_eq!(client.size(), 50);

        fixtures::append_quotes_every(&server, 50, 150, DAY / 100);
        server.commit().unwrap();
        let projected = replicate(&server, &client);
        assert_eq!(client.size(), 200);
        assert_eq!(projected.partitions.len(), 2);
        fixtures::assert_same_rows(&server, &client);
    }

    #[test]
    fn caught_up_client_gets_empty_delta() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 10);
        server.commit().unwrap();
        replicate(&server, &client);

        let mut producer = JournalDeltaProducer::new(server.clone(), 100);
        producer
            .configure(&JournalClientState::capture(0, &client))
            .unwrap();
        assert!(!producer.has_content());

        let mut channel = MockChannel::new();
        assert!(producer.write(&mut channel).unwrap());
        assert_eq!(channel.written(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn empty_server_and_client() {
        let server = fixtures::quote_journal();
        let mut producer = JournalDeltaProducer::new(server, 100);
        producer.configure(&JournalClientState::empty(0)).unwrap();
        assert!(!producer.has_content());
        assert_eq!(
            producer.projected_state(),
            Some(&JournalClientState::empty(0))
        );
    }

    #[test]
    fn inconsistent_client_states_are_rejected() {
        let server = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 10);
        server.commit().unwrap();
        let good = JournalClientState::capture(0, &server);
        let producer = JournalDeltaProducer::new(server, 100);
        assert_eq!(producer.validate(&good), Ok(()));

        let mut ahead = good.clone();
        ahead.partitions.push(ahead.partitions[0]);
        assert!(matches!(
            producer.validate(&ahead),
            Err(ConsistencyError::ClientAhead { client: 2, server: 1 })
        ));

        let mut bucket = good.clone();
        bucket.partitions[0].bucket += 1;
        assert!(matches!(
            producer.validate(&bucket),
            Err(ConsistencyError::BucketMismatch { partition: 0, .. })
        ));

        let mut rows = good.clone();
        rows.partitions[0].rows = 11;
        assert!(matches!(
            producer.validate(&rows),
            Err(ConsistencyError::RowsAhead { client: 11, server: 10, .. })
        ));

        let mut columns = good.clone();
        columns.symbol_counts.push(0);
        assert!(matches!(
            producer.validate(&columns),
            Err(ConsistencyError::SymbolColumns { client: 2, server: 1 })
        ));

        let mut symbols = good.clone();
        symbols.symbol_counts[0] += 1;
        assert!(matches!(
            producer.validate(&symbols),
            Err(ConsistencyError::SymbolTableAhead { table: 0, .. })
        ));

        let mut no_symbols = good;
        no_symbols.symbol_counts.clear();
        assert_eq!(producer.validate(&no_symbols), Ok(()));
    }

    #[test]
    fn configure_surfaces_consistency_error() {
        let server = fixtures::quote_journal();
        let mut producer = JournalDeltaProducer::new(server, 100);
        let mut state = JournalClientState::empty(0);
        state.partitions.push(PartitionState { bucket: 0, rows: 1 });
        let err = producer.configure(&state).unwrap_err();
        assert!(matches!(err, ProtocolError::Consistency(_)));
        assert!(!err.is_fatal());
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn client_matches_server_after_every_cycle(schedule in write_schedule_strategy(6)) {
            let server = fixtures::quote_journal();
            let client = fixtures::quote_journal();
            let mut seq = 0;
            for batch in schedule {
                fixtures::append_quotes_every(&server, seq, batch.rows, DAY / 40);
                if batch.commit {
                    server.commit().unwrap();
                    seq += batch.rows;
                } else {
                    server.rollback().unwrap();
                }
                let projected = replicate(&server, &client);
                fixtures::assert_same_rows(&server, &client);
                prop_assert_eq!(projected, JournalClientState::capture(0, &client));
            }
        }
    }
}
