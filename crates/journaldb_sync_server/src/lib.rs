//! # JournalDB Sync Server
//!
//! Replication server for JournalDB journals.
//!
//! This crate provides:
//! - `ExportRegistry` of journals offered to clients
//! - `ServerAgent`, the per-connection command state machine
//! - `JournalServer`, a TCP accept loop running one agent per connection
//!
//! # Protocol
//!
//! A client binds journals to indexes, reports what it holds, and asks for
//! the rest:
//! 1. `SET_KEY` binds a journal index to an exported key
//! 2. `DELTA_REQUEST` reports the client's state for a bound index
//! 3. `CLIENT_READY` makes the server push one `JOURNAL_DELTA` per journal
//!    with new data, followed by `SERVER_READY`
//!
//! Requests are answered with `"OK"` or a rejection message. While idle the
//! server sends `SERVER_HEARTBEAT` between messages.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod agent;
mod config;
mod error;
mod exports;
mod server;

pub use agent::{AgentState, ServerAgent, INDEX_NOT_BOUND, NOT_EXPORTED};
pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{ServerError, ServerResult};
pub use exports::ExportRegistry;
pub use server::JournalServer;
