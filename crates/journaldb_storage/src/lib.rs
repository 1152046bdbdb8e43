//! # JournalDB Storage
//!
//! Append-only, partitioned column storage for JournalDB.
//!
//! A [`Journal`] stores typed records split into time [`Partition`]s. Each
//! partition keeps one [`Column`] per field; symbol columns store ids into a
//! journal-wide [`SymbolTable`]. Columns sit on [`StorageBackend`] byte
//! stores, either in memory or in files.
//!
//! ## Visibility
//!
//! Appended rows become visible only when the writer commits. Replication
//! consumers write straight into partition columns and publish the new row
//! count with [`Partition::publish_rows`] once every column is complete.
//!
//! ## Example
//!
//! ```rust
//! use journaldb_storage::{ColumnDef, ColumnType, Journal, JournalKey, PartitionType, Schema, Value};
//!
//! let schema = Schema::new(vec![
//!     ColumnDef::new("id", ColumnType::Int),
//!     ColumnDef::new("ts", ColumnType::Timestamp),
//! ])
//! .unwrap()
//! .with_timestamp("ts")
//! .unwrap();
//!
//! let journal = Journal::in_memory(JournalKey::new("event", PartitionType::Day), schema).unwrap();
//! journal.append(&[Value::Int(1), Value::Timestamp(0)]).unwrap();
//! journal.commit().unwrap();
//! assert_eq!(journal.read_row(0, 0).unwrap()[0], Value::Int(1));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod column;
mod config;
mod dir;
mod error;
mod file;
mod journal;
mod memory;
mod partition;
mod schema;
mod symbol;
mod value;

pub use backend::StorageBackend;
pub use column::{Column, FixedColumn, SharedColumn, VarColumn, INDEX_ENTRY_WIDTH};
pub use config::JournalConfig;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::Journal;
pub use memory::InMemoryBackend;
pub use partition::Partition;
pub use schema::{ColumnDef, ColumnType, JournalKey, PartitionType, Schema};
pub use symbol::SymbolTable;
pub use value::Value;
