//! Error types for the journal server.

use journaldb_sync_protocol::ProtocolError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the journal server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A journal with the same key is already exported.
    #[error("journal already exported: {0}")]
    AlreadyExported(String),

    /// The server is already running.
    #[error("server already running on {0}")]
    AlreadyRunning(SocketAddr),

    /// The listener could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Reading or writing a connection failed at the protocol level.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Returns true if the error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        let io = match self {
            ServerError::Protocol(ProtocolError::ChannelClosed) => return true,
            ServerError::Protocol(ProtocolError::Io(e)) | ServerError::Io(e) => e,
            _ => return false,
        };
        matches!(
            io.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        assert!(ServerError::Protocol(ProtocolError::ChannelClosed).is_disconnect());
        assert!(ServerError::Io(io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!ServerError::Protocol(ProtocolError::UnknownCommand(9)).is_disconnect());
        assert!(!ServerError::Internal("oops".into()).is_disconnect());
    }

    #[test]
    fn error_display() {
        let err = ServerError::AlreadyExported("quote".into());
        assert!(err.to_string().contains("quote"));
    }
}
