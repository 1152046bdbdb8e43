//! Partition deltas: symbol sections plus one column delta per column.
//!
//! ```text
//! [u32 partition index][i64 bucket][u64 row_from][u64 row_to]
//! symbol delta for each symbol column, in column order
//! column delta for each column, in column order
//! ```

use crate::channel::{ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::column_delta::{ColumnDeltaConsumer, ColumnDeltaProducer};
use crate::error::{ConsistencyError, ProtocolError, ProtocolResult};
use crate::symbol_delta::{SymbolDeltaConsumer, SymbolDeltaProducer};
use bytes::{Buf, BufMut, BytesMut};
use journaldb_storage::{Journal, Partition, SymbolTable};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::trace;

const HEADER_LEN: usize = 28;

/// Streams the rows of one partition a receiver is missing.
pub struct PartitionDeltaProducer {
    partition: Arc<Partition>,
    symbols: Vec<SymbolDeltaProducer>,
    columns: Vec<ColumnDeltaProducer>,
    header: OutBuffer,
    row_from: u64,
    row_to: u64,
    position: usize,
}

impl PartitionDeltaProducer {
    /// Creates a producer for `partition`, whose symbol columns use
    /// `symbol_tables` in column order.
    pub fn new(
        partition: Arc<Partition>,
        symbol_tables: &[Arc<SymbolTable>],
        chunk_size: usize,
    ) -> ProtocolResult<Self> {
        let mut columns = Vec::with_capacity(partition.column_count());
        for index in 0..partition.column_count() {
            let column = partition.column(index).ok_or_else(|| {
                ProtocolError::malformed(format!("partition has no column {index}"))
            })?;
            columns.push(ColumnDeltaProducer::new(column, chunk_size));
        }
        let symbols = symbol_tables
            .iter()
            .map(|t| SymbolDeltaProducer::new(Arc::clone(t), chunk_size))
            .collect();

        Ok(Self {
            partition,
            symbols,
            columns,
            header: OutBuffer::default(),
            row_from: 0,
            row_to: 0,
            position: 0,
        })
    }

    /// Snapshots the committed row count and configures every column for a
    /// receiver holding `receiver_rows`. Symbol sections default to empty.
    pub fn configure_rows(&mut self, receiver_rows: u64) -> ProtocolResult<()> {
        let committed = self.partition.row_count();
        for column in &mut self.columns {
            column.configure(receiver_rows, committed)?;
        }
        self.row_from = receiver_rows.min(committed);
        self.row_to = committed;

        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u32(self.partition.index() as u32);
        header.put_i64(self.partition.bucket());
        header.put_u64(self.row_from);
        header.put_u64(self.row_to);
        self.header = OutBuffer::new(header.freeze());
        self.position = 0;

        for symbols in &mut self.symbols {
            symbols.configure(0, 0);
        }
        Ok(())
    }

    /// Sets the `(from, to)` entry range of each symbol section.
    pub fn configure_symbols(&mut self, ranges: &[(u64, u64)]) {
        for (symbols, (from, to)) in self.symbols.iter_mut().zip(ranges) {
            symbols.configure(*from, *to);
        }
    }

    /// Sets both rows and symbol ranges.
    pub fn configure(&mut self, receiver_rows: u64, ranges: &[(u64, u64)]) -> ProtocolResult<()> {
        self.configure_rows(receiver_rows)?;
        self.configure_symbols(ranges);
        Ok(())
    }

    /// The partition's header is always written.
    #[must_use]
    pub fn has_frame(&self) -> bool {
        true
    }

    /// The partition being sent.
    #[must_use]
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    /// Row count the receiver will hold after applying the delta.
    #[must_use]
    pub fn row_to(&self) -> u64 {
        self.row_to
    }
}

impl ChannelProducer for PartitionDeltaProducer {
    fn has_content(&self) -> bool {
        self.columns.iter().any(ChannelProducer::has_content)
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        if !self.header.drain(channel)? {
            return Ok(false);
        }
        while self.position < self.symbols.len() + self.columns.len() {
            let done = if self.position < self.symbols.len() {
                self.symbols[self.position].write(channel)?
            } else {
                self.columns[self.position - self.symbols.len()].write(channel)?
            };
            if !done {
                return Ok(false);
            }
            self.position += 1;
        }
        Ok(true)
    }
}

/// Applies a partition delta to the matching partition of a local journal.
///
/// The partition is created if it is the next one. New rows are published
/// only after every column is complete; until then readers keep seeing the
/// old row count. A delta the partition already holds is read and dropped.
pub struct PartitionDeltaConsumer {
    journal: Arc<Journal>,
    buffer_size: usize,
    header: InBuffer,
    symbols: Vec<SymbolDeltaConsumer>,
    columns: Vec<ColumnDeltaConsumer>,
    partition: Option<Arc<Partition>>,
    row_to: u64,
    discard: bool,
    position: usize,
    complete: bool,
}

impl PartitionDeltaConsumer {
    /// Creates a consumer writing into `journal`.
    pub fn new(journal: Arc<Journal>, buffer_size: usize) -> Self {
        let symbols = journal
            .symbol_tables()
            .into_iter()
            .map(SymbolDeltaConsumer::new)
            .collect();
        Self {
            journal,
            buffer_size,
            header: InBuffer::new(HEADER_LEN),
            symbols,
            columns: Vec::new(),
            partition: None,
            row_to: 0,
            discard: false,
            position: 0,
            complete: false,
        }
    }

    /// The partition being written, once the header is read.
    #[must_use]
    pub fn partition(&self) -> Option<&Arc<Partition>> {
        self.partition.as_ref()
    }

    fn open_partition(&mut self) -> ProtocolResult<()> {
        let mut header = self.header.take();
        let index = header.get_u32() as usize;
        let bucket = header.get_i64();
        let row_from = header.get_u64();
        let row_to = header.get_u64();
        if row_to < row_from {
            return Err(ProtocolError::malformed(format!(
                "partition {index} delta ends at {row_to} before it starts at {row_from}"
            )));
        }

        let partition = self
            .journal
            .partition_for_replication(index, bucket)
            .map_err(|e| ProtocolError::storage(format!("partition {index}"), e))?;
        partition
            .truncate_to_committed()
            .map_err(|e| ProtocolError::storage(format!("partition {index}"), e))?;

        let committed = partition.row_count();
        self.discard = if row_from == committed {
            false
        } else if row_to <= committed {
            true
        } else {
            return Err(ConsistencyError::Gap {
                what: format!("partition {index}"),
                delta_start: row_from,
                local: committed,
            }
            .into());
        };

        let mut columns = Vec::with_capacity(partition.column_count());
        for i in 0..partition.column_count() {
            let column = partition
                .column(i)
                .ok_or_else(|| ProtocolError::malformed(format!("partition has no column {i}")))?;
            let mut consumer = ColumnDeltaConsumer::new(column, self.buffer_size);
            consumer.set_discard(self.discard);
            columns.push(consumer);
        }
        for symbols in &mut self.symbols {
            symbols.reset();
        }

        trace!(
            partition = index,
            row_from,
            row_to,
            discard = self.discard,
            "receiving partition delta"
        );
        self.columns = columns;
        self.row_to = row_to;
        self.position = 0;
        self.partition = Some(partition);
        Ok(())
    }
}

impl ChannelConsumer for PartitionDeltaConsumer {
    fn reset(&mut self) {
        self.header.expect(HEADER_LEN);
        for symbols in &mut self.symbols {
            symbols.reset();
        }
        self.columns.clear();
        self.partition = None;
        self.row_to = 0;
        self.discard = false;
        self.position = 0;
        self.complete = false;
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        if self.complete {
            return Ok(());
        }
        if self.partition.is_none() {
            if !self.header.fill(channel)? {
                return Ok(());
            }
            self.open_partition()?;
        }

        while self.position < self.symbols.len() + self.columns.len() {
            let consumer: &mut dyn ChannelConsumer = if self.position < self.symbols.len() {
                &mut self.symbols[self.position]
            } else {
                &mut self.columns[self.position - self.symbols.len()]
            };
            consumer.read(channel)?;
            if !consumer.is_complete() {
                return Ok(());
            }
            self.position += 1;
        }

        if let Some(partition) = &self.partition {
            if !self.discard {
                partition
                    .publish_rows(self.row_to)
                    .map_err(|e| ProtocolError::storage(format!("partition {}", partition.index()), e))?;
            }
        }
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journaldb_testkit::{fixtures, MockChannel};

    fn send(
        server: &Arc<Journal>,
        client: &Arc<Journal>,
        partition: usize,
        channel: &mut MockChannel,
    ) -> bool {
        let tables = server.symbol_tables();
        let ranges: Vec<(u64, u64)> = tables
            .iter()
            .zip(client.symbol_tables())
            .map(|(s, c)| (c.len(), s.len()))
            .collect();
        let receiver_rows = client.partition(partition).map_or(0, |p| p.row_count());

        let mut producer =
            PartitionDeltaProducer::new(server.partition(partition).unwrap(), &tables, 128)
                .unwrap();
        producer.configure(receiver_rows, &ranges).unwrap();
        let has_content = producer.has_content();

        let mut consumer = PartitionDeltaConsumer::new(client.clone(), 64);
        let mut spins = 0;
        while !consumer.is_complete() {
            producer.write(channel).unwrap();
            channel.loopback();
            consumer.read(channel).unwrap();
            spins += 1;
            assert!(spins < 100_000);
        }
        has_content
    }

    #[test]
    fn empty_client_receives_partition() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 250);
        server.commit().unwrap();

        assert!(send(&server, &client, 0, &mut MockChannel::new()));
        fixtures::assert_same_rows(&server, &client);
    }

    #[test]
    fn client_smaller_receives_suffix() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 100);
        server.commit().unwrap();
        assert!(send(&server, &client, 0, &mut MockChannel::new()));

        fixtures::append_quotes(&server, 100, 50);
        server.commit().unwrap();
        let channel = &mut MockChannel::new()
            .with_max_read(5)
            .with_max_write(11)
            .with_blocking_reads(false)
            .with_blocking_writes(false);
        assert!(send(&server, &client, 0, channel));
        assert_eq!(client.size(), 150);
        fixtures::assert_same_rows(&server, &client);
    }

    #[test]
    fn equal_client_gets_header_only() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 20);
        server.commit().unwrap();
        send(&server, &client, 0, &mut MockChannel::new());

        assert!(!send(&server, &client, 0, &mut MockChannel::new()));
        assert_eq!(client.size(), 20);
    }

    #[test]
    fn uncommitted_rows_are_not_sent() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 30);
        server.commit().unwrap();
        fixtures::append_quotes(&server, 30, 10);

        send(&server, &client, 0, &mut MockChannel::new());
        assert_eq!(client.size(), 30);
    }

    #[test]
    fn replayed_delta_is_a_no_op() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 40);
        server.commit().unwrap();

        let tables = server.symbol_tables();
        let mut producer =
            PartitionDeltaProducer::new(server.partition(0).unwrap(), &tables, 128).unwrap();
        producer.configure(0, &[(0, tables[0].len())]).unwrap();
        let mut out = MockChannel::new();
        assert!(producer.write(&mut out).unwrap());
        let bytes = out.written();

        for _ in 0..2 {
            let mut channel = MockChannel::new();
            channel.feed(&bytes);
            let mut consumer = PartitionDeltaConsumer::new(client.clone(), 64);
            consumer.read(&mut channel).unwrap();
            assert!(consumer.is_complete());
            assert_eq!(client.size(), 40);
        }
        fixtures::assert_same_rows(&server, &client);
    }

    #[test]
    fn gap_is_rejected() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 40);
        server.commit().unwrap();

        let tables = server.symbol_tables();
        let mut producer =
            PartitionDeltaProducer::new(server.partition(0).unwrap(), &tables, 128).unwrap();
        producer.configure(10, &[(0, tables[0].len())]).unwrap();
        let mut channel = MockChannel::new();
        producer.write(&mut channel).unwrap();
        channel.loopback();

        let mut consumer = PartitionDeltaConsumer::new(client.clone(), 64);
        let err = consumer.read(&mut channel).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Consistency(ConsistencyError::Gap { .. })
        ));
        assert_eq!(client.size(), 0);
    }

    #[test]
    fn interrupted_transfer_leaves_committed_rows() {
        let server = fixtures::quote_journal();
        let client = fixtures::quote_journal();
        fixtures::append_quotes(&server, 0, 60);
        server.commit().unwrap();
        send(&server, &client, 0, &mut MockChannel::new());

        fixtures::append_quotes(&server, 60, 60);
        server.commit().unwrap();
        let tables = server.symbol_tables();
        let mut producer =
            PartitionDeltaProducer::new(server.partition(0).unwrap(), &tables, 128).unwrap();
        producer.configure(60, &[(tables[0].len(), tables[0].len())]).unwrap();
        let mut out = MockChannel::new();
        producer.write(&mut out).unwrap();
        let bytes = out.written();

        let mut channel = MockChannel::new();
        channel.feed(&bytes[..bytes.len() * 2 / 3]);
        channel.close();
        let mut consumer = PartitionDeltaConsumer::new(client.clone(), 64);
        assert!(consumer.read(&mut channel).is_err());
        assert_eq!(client.size(), 60);

        // The next cycle truncates the partial data and applies cleanly.
        assert!(send(&server, &client, 0, &mut MockChannel::new()));
        fixtures::assert_same_rows(&server, &client);
    }
}
