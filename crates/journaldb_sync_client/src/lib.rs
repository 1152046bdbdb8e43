//! # JournalDB Sync Client
//!
//! Replication client for JournalDB journals.
//!
//! This crate provides:
//! - `JournalClient`, which binds remote journals to local ones and runs
//!   sync cycles over a blocking channel
//! - Client state machine and cumulative statistics
//! - Background replication with retry and exponential backoff
//!
//! ## Sync cycle
//!
//! 1. `SET_KEY` once per subscription at handshake
//! 2. `DELTA_REQUEST` with the committed state of every local journal
//! 3. `CLIENT_READY`, then apply `JOURNAL_DELTA`s until `SERVER_READY`
//!
//! The server is authoritative. Applying a delta twice is harmless, and a
//! transfer cut short leaves the local journal at its last committed rows.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod background;
mod client;
mod config;
mod error;
mod state;

pub use background::{spawn_replication, Replication, SyncEvent};
pub use client::JournalClient;
pub use config::{ClientConfig, RetryConfig, DEFAULT_SERVER_ADDR};
pub use error::{ClientError, ClientResult};
pub use state::{ClientState, SyncCycleResult, SyncStats};
