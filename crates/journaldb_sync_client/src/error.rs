//! Error types for the replication client.

use journaldb_storage::StorageError;
use journaldb_sync_protocol::{Command, ProtocolError};
use std::io;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while replicating from a server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Reading or writing the connection failed at the protocol level.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server answered a request with something other than "OK".
    #[error("server rejected request: {reason}")]
    Rejected {
        /// Text sent by the server.
        reason: String,
    },

    /// The server sent a command that makes no sense at this point.
    #[error("unexpected {found} while waiting for {expected}")]
    UnexpectedCommand {
        /// What the client was waiting for.
        expected: &'static str,
        /// Command received.
        found: Command,
    },

    /// Local journal failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Connecting or configuring the socket failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The server did not answer in time.
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    /// A sync was requested before the client was keyed.
    #[error("not connected to server")]
    NotConnected,

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl ClientError {
    /// Creates a rejection error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns true if reconnecting and trying again can succeed.
    ///
    /// Rejections and inconsistent local state need someone to intervene.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::Timeout(_) | ClientError::NotConnected => true,
            ClientError::Protocol(e) => matches!(e, ProtocolError::Io(_) | ProtocolError::ChannelClosed),
            _ => false,
        }
    }
}
