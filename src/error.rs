//! Error taxonomy for per-connection and per-operation failures.
//!
//! Every failure a virtual client can hit is expressed as a [`HarnessError`].
//! None of these abort the run: the driver converts them into outcome records
//! and error strings for the metrics aggregator. Process-level failures
//! (invalid configuration, unwritable output files) use `anyhow` instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures local to a single virtual client
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A connection attempt exceeded the connect timeout
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Transport-level failure while connecting (refused, reset, DNS)
    #[error("connect failed: {0}")]
    Connect(String),

    /// No reply arrived within the per-operation deadline
    #[error("no reply within {0:?}")]
    OperationTimeout(Duration),

    /// The request could not be written within the per-operation deadline.
    /// Part of it may be on the wire, so the stream is unusable.
    #[error("request not written within {0:?}")]
    SendTimeout(Duration),

    /// A reply could not be parsed as declared
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        message: String,
        /// The reader no longer knows where the next reply starts
        desynchronized: bool,
    },

    /// The peer closed the stream
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The service answered with an explicit error reply
    #[error("server error: {0}")]
    Application(String),

    /// I/O failure on an established connection
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was stopped while this client was waiting
    #[error("interrupted by stop request")]
    Interrupted,
}

/// Coarse classification used for failure counters in the metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectTimeout,
    ConnectError,
    OperationTimeout,
    ProtocolViolation,
    ConnectionClosed,
    ApplicationError,
    Io,
    Interrupted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ConnectTimeout => "connect timeout",
            ErrorKind::ConnectError => "connect error",
            ErrorKind::OperationTimeout => "operation timeout",
            ErrorKind::ProtocolViolation => "protocol violation",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::ApplicationError => "application error",
            ErrorKind::Io => "i/o error",
            ErrorKind::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

impl HarnessError {
    pub fn protocol(message: impl Into<String>, desynchronized: bool) -> Self {
        HarnessError::ProtocolViolation {
            message: message.into(),
            desynchronized,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            HarnessError::Connect(_) => ErrorKind::ConnectError,
            HarnessError::OperationTimeout(_) | HarnessError::SendTimeout(_) => {
                ErrorKind::OperationTimeout
            }
            HarnessError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            HarnessError::ConnectionClosed => ErrorKind::ConnectionClosed,
            HarnessError::Application(_) => ErrorKind::ApplicationError,
            HarnessError::Io(_) => ErrorKind::Io,
            HarnessError::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Whether the owning client must stop using its connection.
    ///
    /// A closed peer, a broken socket, a half-written request or a
    /// desynchronized reply stream leave nothing usable behind; reply
    /// timeouts and server errors do not.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            HarnessError::ConnectionClosed
            | HarnessError::Io(_)
            | HarnessError::SendTimeout(_)
            | HarnessError::Interrupted => true,
            HarnessError::ProtocolViolation { desynchronized, .. } => *desynchronized,
            _ => false,
        }
    }
}
