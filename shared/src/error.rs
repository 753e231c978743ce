//! Error types for WebExpose.

use thiserror::Error;

use crate::protocol::CorrelationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No tunnel connected")]
    NoUpstream,

    #[error("Duplicate correlation id: {0}")]
    DuplicateId(CorrelationId),

    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(CorrelationId),

    #[error("Tunnel send failed: {0}")]
    SendFailure(String),

    #[error("Tunnel receive failed: {0}")]
    ReceiveFailure(String),

    #[error("Timeout")]
    Timeout,

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Local service error: {0}")]
    LocalCall(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the tunnel connection itself is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::SendFailure(_) | Error::ReceiveFailure(_) | Error::Connection(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
