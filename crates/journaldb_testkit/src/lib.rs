//! # JournalDB Testkit
//!
//! Test utilities for JournalDB.
//!
//! This crate provides:
//! - Quote journal fixtures and row comparison helpers
//! - In-memory channels that simulate partial and non-blocking I/O
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use journaldb_testkit::prelude::*;
//!
//! #[test]
//! fn replicates() {
//!     let server = quote_journal();
//!     append_quotes(&server, 0, 100);
//!     server.commit().unwrap();
//!     // ... replicate into a client journal
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mock;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::mock::MockChannel;
}

pub use mock::MockChannel;
