//! # JournalDB Sync Protocol
//!
//! Wire protocol for replicating JournalDB journals from a server to its
//! clients.
//!
//! This crate provides:
//! - Command tags (`MAGIC` byte plus command code)
//! - Length-prefixed frames, string and int responses
//! - CBOR request payloads: `IndexedJournalKey`, `JournalClientState`
//! - Column, symbol, partition and journal deltas
//!
//! Every element is written by a [`ChannelProducer`] and read by a
//! [`ChannelConsumer`]. Both are resumable over non-blocking channels, so
//! a transfer can stop at any byte and continue on the next call.
//!
//! Integers on the wire are big-endian.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod column_delta;
mod command;
mod error;
mod frame;
mod journal_delta;
mod messages;
mod partition_delta;
mod symbol_delta;

pub use channel::{
    is_not_ready, read_some, write_fully, ChannelConsumer, ChannelProducer, InBuffer, OutBuffer,
};
pub use column_delta::{ColumnDeltaConsumer, ColumnDeltaProducer, DEFAULT_CHUNK_SIZE};
pub use command::{Command, CommandConsumer, CommandProducer, MAGIC, TAG_LEN};
pub use error::{ConsistencyError, ProtocolError, ProtocolResult};
pub use frame::{
    FrameConsumer, FrameProducer, IntResponseConsumer, IntResponseProducer,
    StringResponseConsumer, StringResponseProducer, MAX_FRAME_LENGTH, OK,
};
pub use journal_delta::{JournalDeltaConsumer, JournalDeltaProducer};
pub use messages::{from_cbor, to_cbor, IndexedJournalKey, JournalClientState, PartitionState};
pub use partition_delta::{PartitionDeltaConsumer, PartitionDeltaProducer};
pub use symbol_delta::{SymbolDeltaConsumer, SymbolDeltaProducer};
