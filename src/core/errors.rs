// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the relay.
/// `std::io::Error` causes are wrapped in an `Arc` to keep the type cheaply
/// cloneable across event handlers and pool jobs.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The transport closed or failed. `cause` carries the socket-level error
    /// when there was one; `None` means the peer closed the stream cleanly.
    #[error("connection closed{}", .cause.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    Disconnected { cause: Option<Arc<std::io::Error>> },

    /// Cooperative shutdown. Never logged as an error.
    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The command gateway already has a command in flight.
    #[error("a command is already running")]
    CommandRefused,

    #[error("command timed out")]
    TimedOut,

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Folds a transport-level I/O failure into `Disconnected` while leaving
    /// every other variant untouched. Used at the read/send boundary where an
    /// I/O error means the connection is gone.
    pub fn into_disconnected(self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Disconnected { cause: Some(e) },
            other => other,
        }
    }

    /// Whether this is an ordinary end-of-connection rather than something
    /// worth a warning. Resets and broken pipes count as ordinary; clients
    /// are free to vanish abruptly.
    pub fn is_clean_disconnect(&self) -> bool {
        match self {
            RelayError::Disconnected { cause: None } => true,
            RelayError::Disconnected { cause: Some(e) } => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(Arc::new(e))
    }
}
