//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to truncate storage to a size larger than it currently is.
    #[error("cannot truncate to size {requested} which is greater than current size {size}")]
    InvalidTruncate {
        /// The requested size.
        requested: u64,
        /// The current size.
        size: u64,
    },

    /// The stored data is corrupted or internally inconsistent.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A record or column does not match the journal schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A record falls into a partition older than the newest one.
    #[error("record bucket {bucket} is older than newest partition bucket {newest}")]
    OutOfOrder {
        /// Bucket of the rejected record.
        bucket: i64,
        /// Bucket of the newest partition.
        newest: i64,
    },

    /// A symbol id has no entry in its symbol table.
    #[error("unknown symbol id {id} in column {column}")]
    UnknownSymbol {
        /// Column name.
        column: String,
        /// The unresolved id.
        id: i32,
    },

    /// A partition index is not valid for the requested operation.
    #[error("invalid partition {index} (journal has {count})")]
    InvalidPartition {
        /// Requested partition index.
        index: usize,
        /// Number of partitions the journal has.
        count: usize,
    },

    /// Another process holds the journal lock.
    #[error("journal is locked by another process: {}", .0.display())]
    JournalLocked(PathBuf),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a schema mismatch error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }
}
