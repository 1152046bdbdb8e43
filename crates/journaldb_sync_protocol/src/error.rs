//! Error types for the replication protocol.

use journaldb_storage::StorageError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while producing or consuming protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The channel failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the channel.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A command tag did not start with the protocol magic byte.
    #[error("bad magic byte {found:#04x}, expected {expected:#04x}")]
    BadMagic {
        /// Byte received.
        found: u8,
        /// Byte expected.
        expected: u8,
    },

    /// A frame announced a length above the limit.
    #[error("frame of {found} bytes exceeds maximum {max}")]
    FrameTooLong {
        /// Announced length.
        found: u64,
        /// Maximum allowed length.
        max: u32,
    },

    /// A command code outside the vocabulary.
    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),

    /// A structured payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A message did not have the expected structure.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Storage failed while reading or applying a delta.
    #[error("storage error in {context}: {source}")]
    Storage {
        /// What was being read or written.
        context: String,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The peers' views of a journal cannot be reconciled.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

impl ProtocolError {
    /// Wraps a storage error with context.
    pub fn storage(context: impl Into<String>, source: StorageError) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    /// Creates a malformed message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Returns true if the channel can no longer be used.
    ///
    /// Consistency errors are reported to the peer; everything else ends
    /// the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Consistency(_))
    }
}

/// A client state that cannot have been produced from the server's journal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// The client reports more partitions than the server has.
    #[error("client has {client} partitions, server has {server}")]
    ClientAhead {
        /// Client partition count.
        client: usize,
        /// Server partition count.
        server: usize,
    },

    /// A client partition covers a different time bucket.
    #[error("partition {partition} bucket mismatch: client {client}, server {server}")]
    BucketMismatch {
        /// Partition index.
        partition: usize,
        /// Client bucket.
        client: i64,
        /// Server bucket.
        server: i64,
    },

    /// A client partition has more rows than the server's.
    #[error("partition {partition} rows ahead: client {client}, server {server}")]
    RowsAhead {
        /// Partition index.
        partition: usize,
        /// Client row count.
        client: u64,
        /// Server row count.
        server: u64,
    },

    /// The client reports a different number of symbol tables.
    #[error("client reports {client} symbol tables, server has {server}")]
    SymbolColumns {
        /// Client count.
        client: usize,
        /// Server count.
        server: usize,
    },

    /// A client symbol table has more entries than the server's.
    #[error("symbol table {table} ahead: client {client}, server {server}")]
    SymbolTableAhead {
        /// Symbol table position in symbol column order.
        table: usize,
        /// Client entry count.
        client: u64,
        /// Server entry count.
        server: u64,
    },

    /// A received delta does not start where the local data ends.
    #[error("{what} delta starts at {delta_start}, local data ends at {local}")]
    Gap {
        /// What the delta applies to.
        what: String,
        /// Where the delta starts.
        delta_start: u64,
        /// Local size.
        local: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_errors_are_not_fatal() {
        let err: ProtocolError = ConsistencyError::ClientAhead {
            client: 3,
            server: 2,
        }
        .into();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "client has 3 partitions, server has 2");

        assert!(ProtocolError::ChannelClosed.is_fatal());
        assert!(ProtocolError::UnknownCommand(9).is_fatal());
    }

    #[test]
    fn storage_error_keeps_context() {
        let err = ProtocolError::storage(
            "column price",
            StorageError::corrupted("short read"),
        );
        let msg = err.to_string();
        assert!(msg.contains("column price"));
        assert!(msg.contains("short read"));
    }
}
