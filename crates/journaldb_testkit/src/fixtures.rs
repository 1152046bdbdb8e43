//! Test fixtures and journal helpers.
//!
//! Provides a quote journal used across the replication tests, plus helpers
//! for filling it and comparing two journals row by row.

use journaldb_storage::{
    ColumnDef, ColumnType, Journal, JournalConfig, JournalKey, PartitionType, Schema, Value,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Timestamp of the first generated quote: 2024-01-01T00:00:00Z.
pub const BASE_TIMESTAMP: i64 = 1_704_067_200_000;

/// Symbols the generated quotes cycle through.
pub const SYMBOLS: [&str; 6] = ["BP.L", "RBS.L", "GOOG", "MSFT", "AAPL", "VOD.L"];

const EXCHANGES: [&str; 3] = ["LXE", "BATS", "CHIX-EU"];

/// Key of the quote journal.
pub fn quote_key() -> JournalKey {
    JournalKey::new("quote", PartitionType::Day)
}

/// Schema of the quote journal.
pub fn quote_schema() -> Schema {
    Schema::new(vec![
        ColumnDef::new("sym", ColumnType::Symbol),
        ColumnDef::new("bid", ColumnType::Double),
        ColumnDef::new("ask", ColumnType::Double),
        ColumnDef::new("bid_size", ColumnType::Int),
        ColumnDef::new("ex", ColumnType::String),
        ColumnDef::new("ts", ColumnType::Timestamp),
    ])
    .and_then(|s| s.with_timestamp("ts"))
    .expect("quote schema is valid")
}

/// Creates an empty in-memory quote journal.
pub fn quote_journal() -> Arc<Journal> {
    Arc::new(Journal::in_memory(quote_key(), quote_schema()).expect("Failed to create journal"))
}

/// Opens a file-backed quote journal at `path`.
pub fn open_quote_journal(path: &Path) -> Arc<Journal> {
    Arc::new(
        Journal::open(path, quote_key(), quote_schema(), JournalConfig::default())
            .expect("Failed to open journal"),
    )
}

/// A file-backed quote journal with automatic cleanup.
pub struct TestJournal {
    /// The journal instance.
    pub journal: Arc<Journal>,
    temp_dir: TempDir,
}

impl TestJournal {
    /// Creates an empty quote journal in a temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let journal = open_quote_journal(&temp_dir.path().join("quote"));
        Self { journal, temp_dir }
    }

    /// Directory holding the journal.
    pub fn path(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("quote")
    }
}

impl Default for TestJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestJournal {
    type Target = Arc<Journal>;

    fn deref(&self) -> &Self::Target {
        &self.journal
    }
}

/// The quote with sequence number `seq` and timestamp `ts`.
pub fn quote_row(seq: u64, ts: i64) -> Vec<Value> {
    let bid = seq as f64 * 0.25;
    vec![
        Value::Symbol(SYMBOLS[(seq % SYMBOLS.len() as u64) as usize].to_string()),
        Value::Double(bid),
        Value::Double(bid + 0.5),
        Value::Int((seq % 10_000) as i32),
        Value::String(EXCHANGES[(seq % EXCHANGES.len() as u64) as usize].to_string()),
        Value::Timestamp(ts),
    ]
}

/// Appends `count` quotes one second apart, starting at sequence `start`.
///
/// Rows are not committed.
pub fn append_quotes(journal: &Journal, start: u64, count: u64) {
    append_quotes_every(journal, start, count, 1000);
}

/// Appends `count` quotes `interval_ms` apart, starting at sequence `start`.
pub fn append_quotes_every(journal: &Journal, start: u64, count: u64, interval_ms: i64) {
    for seq in start..start + count {
        let ts = BASE_TIMESTAMP + seq as i64 * interval_ms;
        journal
            .append(&quote_row(seq, ts))
            .expect("Failed to append quote");
    }
}

/// Asserts both journals hold the same committed partitions and rows.
pub fn assert_same_rows(expected: &Journal, actual: &Journal) {
    assert_eq!(
        expected.partition_count(),
        actual.partition_count(),
        "partition count"
    );
    for (e, a) in expected.partitions().iter().zip(actual.partitions()) {
        assert_eq!(e.bucket(), a.bucket(), "bucket of partition {}", e.index());
        assert_eq!(e.row_count(), a.row_count(), "rows of partition {}", e.index());
        for row in 0..e.row_count() {
            assert_eq!(
                expected.read_row(e.index(), row).expect("expected row"),
                actual.read_row(a.index(), row).expect("actual row"),
                "row {row} of partition {}",
                e.index()
            );
        }
    }
}
