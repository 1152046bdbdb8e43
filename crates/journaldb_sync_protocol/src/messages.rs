//! Structured request payloads, encoded as CBOR.

use crate::error::{ProtocolError, ProtocolResult};
use journaldb_storage::{Journal, JournalKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A journal key bound to a client-chosen index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedJournalKey {
    /// Index the client uses for this journal on the connection.
    pub index: u32,
    /// Key of the exported journal.
    pub key: JournalKey,
}

impl IndexedJournalKey {
    /// Creates an indexed key.
    pub fn new(index: u32, key: JournalKey) -> Self {
        Self { index, key }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// High-water mark of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    /// Partition bucket.
    pub bucket: i64,
    /// Committed rows.
    pub rows: u64,
}

/// What a client holds of one journal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalClientState {
    /// Index the journal is bound to.
    pub journal_index: u32,
    /// Per-partition high-water marks, in partition order.
    pub partitions: Vec<PartitionState>,
    /// Entry count of each symbol table, in symbol column order.
    pub symbol_counts: Vec<u64>,
}

impl JournalClientState {
    /// State of a client holding nothing.
    #[must_use]
    pub fn empty(journal_index: u32) -> Self {
        Self {
            journal_index,
            ..Self::default()
        }
    }

    /// Captures the committed state of `journal`.
    ///
    /// Row counts are read before symbol counts, so every symbol id a
    /// counted row references is covered.
    #[must_use]
    pub fn capture(journal_index: u32, journal: &Journal) -> Self {
        let partitions = journal
            .partitions()
            .iter()
            .map(|p| PartitionState {
                bucket: p.bucket(),
                rows: p.row_count(),
            })
            .collect();
        let symbol_counts = journal.symbol_tables().iter().map(|t| t.len()).collect();
        Self {
            journal_index,
            partitions,
            symbol_counts,
        }
    }

    /// Total rows over all partitions.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    /// Rows held of partition `index`, zero if unseen.
    #[must_use]
    pub fn rows_of(&self, index: usize) -> u64 {
        self.partitions.get(index).map_or(0, |p| p.rows)
    }

    /// Entries held of symbol table `table`, zero if unseen.
    #[must_use]
    pub fn symbols_of(&self, table: usize) -> u64 {
        self.symbol_counts.get(table).copied().unwrap_or(0)
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Encodes a value as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| ProtocolError::Codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
}
