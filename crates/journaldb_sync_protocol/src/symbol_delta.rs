//! Symbol table deltas: the dictionary entries a receiver is missing.
//!
//! ```text
//! [u64 from][u64 count] then count x ([u32 len][len bytes of UTF-8])
//! ```

use crate::channel::{ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::error::{ConsistencyError, ProtocolError, ProtocolResult};
use crate::frame::MAX_FRAME_LENGTH;
use bytes::{Buf, BufMut, BytesMut};
use journaldb_storage::SymbolTable;
use std::io::{Read, Write};
use std::sync::Arc;

const HEADER_LEN: usize = 16;

/// Streams entries `[from, to)` of a symbol table.
pub struct SymbolDeltaProducer {
    table: Arc<SymbolTable>,
    chunk_size: usize,
    from: u64,
    to: u64,
    cursor: u64,
    out: OutBuffer,
}

impl SymbolDeltaProducer {
    /// Creates a producer for `table`.
    pub fn new(table: Arc<SymbolTable>, chunk_size: usize) -> Self {
        Self {
            table,
            chunk_size: chunk_size.max(1),
            from: 0,
            to: 0,
            cursor: 0,
            out: OutBuffer::default(),
        }
    }

    /// Sets up the delta for a receiver holding `from` entries, sending up
    /// to the snapshot `to`.
    pub fn configure(&mut self, from: u64, to: u64) {
        let to = to.max(from);
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u64(from);
        header.put_u64(to - from);
        self.from = from;
        self.to = to;
        self.cursor = from;
        self.out = OutBuffer::new(header.freeze());
    }

    /// Entry count the receiver will hold after applying the delta.
    #[must_use]
    pub fn target(&self) -> u64 {
        self.to
    }

    fn next_chunk(&mut self) -> bool {
        if self.cursor >= self.to {
            return false;
        }
        let mut buf = BytesMut::new();
        while self.cursor < self.to && buf.len() < self.chunk_size {
            let batch = self.table.values_range(self.cursor, (self.cursor + 16).min(self.to));
            if batch.is_empty() {
                // Snapshot is bounded by the table size, which never shrinks.
                self.cursor = self.to;
                break;
            }
            for value in batch {
                buf.put_u32(value.len() as u32);
                buf.put_slice(value.as_bytes());
                self.cursor += 1;
            }
        }
        self.out.set(buf.freeze());
        true
    }
}

impl ChannelProducer for SymbolDeltaProducer {
    fn has_content(&self) -> bool {
        self.to > self.from
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        loop {
            if !self.out.drain(channel)? {
                return Ok(false);
            }
            if !self.next_chunk() {
                return Ok(true);
            }
        }
    }
}

/// Appends received entries to a local symbol table.
///
/// Entries the table already holds are checked rather than appended, so a
/// delta overlapping local data is accepted as long as it agrees with it.
pub struct SymbolDeltaConsumer {
    table: Arc<SymbolTable>,
    header: InBuffer,
    entry_len: InBuffer,
    entry: Option<InBuffer>,
    from: u64,
    count: u64,
    received: u64,
    started: bool,
}

impl SymbolDeltaConsumer {
    /// Creates a consumer writing into `table`.
    pub fn new(table: Arc<SymbolTable>) -> Self {
        Self {
            table,
            header: InBuffer::new(HEADER_LEN),
            entry_len: InBuffer::new(4),
            entry: None,
            from: 0,
            count: 0,
            received: 0,
            started: false,
        }
    }

    fn apply(&mut self, value: String) -> ProtocolResult<()> {
        let id = self.from + self.received;
        if id < self.table.len() {
            let local = self.table.value(id as i32);
            if local.as_deref() != Some(value.as_str()) {
                return Err(ProtocolError::malformed(format!(
                    "symbol {id} of {} is {local:?} locally, {value:?} remotely",
                    self.table.column()
                )));
            }
        } else {
            self.table
                .append(value)
                .map_err(|e| ProtocolError::storage(format!("symbol table {}", self.table.column()), e))?;
        }
        self.received += 1;
        Ok(())
    }
}

impl ChannelConsumer for SymbolDeltaConsumer {
    fn reset(&mut self) {
        self.header.expect(HEADER_LEN);
        self.entry_len.expect(4);
        self.entry = None;
        self.from = 0;
        self.count = 0;
        self.received = 0;
        self.started = false;
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        if !self.started {
            if !self.header.fill(channel)? {
                return Ok(());
            }
            let mut header = self.header.take();
            self.from = header.get_u64();
            self.count = header.get_u64();
            let local = self.table.len();
            if self.from > local {
                return Err(ConsistencyError::Gap {
                    what: format!("symbol table {}", self.table.column()),
                    delta_start: self.from,
                    local,
                }
                .into());
            }
            self.started = true;
        }

        while self.received < self.count {
            if self.entry.is_none() {
                if !self.entry_len.fill(channel)? {
                    return Ok(());
                }
                let mut len = self.entry_len.take();
                let len = len.get_u32();
                if len > MAX_FRAME_LENGTH {
                    return Err(ProtocolError::FrameTooLong {
                        found: u64::from(len),
                        max: MAX_FRAME_LENGTH,
                    });
                }
                self.entry_len.expect(4);
                self.entry = Some(InBuffer::new(len as usize));
            }
            let Some(entry) = self.entry.as_mut() else {
                continue;
            };
            if !entry.fill(channel)? {
                return Ok(());
            }
            let bytes = entry.take();
            self.entry = None;
            let value = String::from_utf8(bytes.to_vec())
                .map_err(|_| ProtocolError::malformed("symbol is not UTF-8"))?;
            self.apply(value)?;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.started && self.received >= self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journaldb_testkit::generators::{symbol_strategy, PropTestConfig};
    use journaldb_testkit::MockChannel;
    use proptest::prelude::*;

    fn table(values: &[&str]) -> Arc<SymbolTable> {
        let table = Arc::new(SymbolTable::in_memory("sym"));
        for v in values {
            table.put(v).unwrap();
        }
        table
    }

    fn run(producer: &mut SymbolDeltaProducer, consumer: &mut SymbolDeltaConsumer) {
        let mut channel = MockChannel::new().with_max_read(3).with_blocking_reads(false);
        assert!(producer.write(&mut channel).unwrap());
        channel.loopback();
        while !consumer.is_complete() {
            consumer.read(&mut channel).unwrap();
        }
    }

    #[test]
    fn sends_missing_entries_in_id_order() {
        let sender = table(&["BP.L", "RBS.L", "GOOG", "ÄÖÜ"]);
        let receiver = table(&["BP.L"]);

        let mut producer = SymbolDeltaProducer::new(sender.clone(), 5);
        producer.configure(1, sender.len());
        assert!(producer.has_content());

        let mut consumer = SymbolDeltaConsumer::new(receiver.clone());
        run(&mut producer, &mut consumer);

        assert_eq!(receiver.len(), 4);
        assert_eq!(receiver.value(3).as_deref(), Some("ÄÖÜ"));
        assert_eq!(receiver.id_of("GOOG"), Some(2));
    }

    #[test]
    fn snapshot_bounds_the_delta() {
        let sender = table(&["a", "b"]);
        let mut producer = SymbolDeltaProducer::new(sender.clone(), 64);
        producer.configure(0, 2);
        sender.put("c").unwrap();

        let receiver = table(&[]);
        let mut consumer = SymbolDeltaConsumer::new(receiver.clone());
        run(&mut producer, &mut consumer);
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn empty_delta_still_has_header() {
        let sender = table(&["a"]);
        let mut producer = SymbolDeltaProducer::new(sender, 64);
        producer.configure(1, 1);
        assert!(!producer.has_content());

        let receiver = table(&["a"]);
        let mut consumer = SymbolDeltaConsumer::new(receiver.clone());
        run(&mut producer, &mut consumer);
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn replayed_entries_are_checked_not_duplicated() {
        let sender = table(&["a", "b", "c"]);
        let receiver = table(&["a", "b"]);
        let mut producer = SymbolDeltaProducer::new(sender, 64);
        producer.configure(0, 3);

        let mut consumer = SymbolDeltaConsumer::new(receiver.clone());
        run(&mut producer, &mut consumer);
        assert_eq!(receiver.len(), 3);
    }

    #[test]
    fn gap_is_a_consistency_error() {
        let sender = table(&["a", "b", "c"]);
        let mut producer = SymbolDeltaProducer::new(sender, 64);
        producer.configure(2, 3);

        let mut channel = MockChannel::new();
        producer.write(&mut channel).unwrap();
        channel.loopback();

        let mut consumer = SymbolDeltaConsumer::new(table(&[]));
        let err = consumer.read(&mut channel).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Consistency(ConsistencyError::Gap { .. })
        ));
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn receiver_prefix_catches_up(
            values in prop::collection::vec(symbol_strategy(), 0..40),
            held in 0usize..40,
        ) {
            let sender = table(&[]);
            for v in &values {
                sender.put(v).unwrap();
            }
            let held = (held as u64).min(sender.len());
            let receiver = table(&[]);
            for v in sender.values_range(0, held) {
                receiver.append(v).unwrap();
            }

            let mut producer = SymbolDeltaProducer::new(sender.clone(), 7);
            producer.configure(held, sender.len());
            let mut consumer = SymbolDeltaConsumer::new(receiver.clone());
            run(&mut producer, &mut consumer);

            prop_assert_eq!(
                receiver.values_range(0, receiver.len()),
                sender.values_range(0, sender.len())
            );
        }
    }
}
