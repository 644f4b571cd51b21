//! Error types shared by the protocol, transport and dashboard layers.
//!
//! Each layer has its own enum so callers can tell a malformed frame apart
//! from a socket failure or a failed request handler.

use thiserror::Error;

/// Failures of the wire codec and the message builder.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error("failed to deserialize message: {0}")]
    Deserialization(String),

    #[error("message type was never set")]
    MissingType,

    #[error("invalid message: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Failures of the listening socket and connection bookkeeping.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection manager is already running")]
    AlreadyStarted,

    #[error("server is at capacity ({0} clients)")]
    AtCapacity(usize),
}

/// Failures reported by the external change source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0} is not available")]
    Unavailable(&'static str),

    #[error("log file not found: {0}")]
    LogNotFound(String),
}

/// Failures of the orchestrator, including request handler failures.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("unknown request type: {0}")]
    UnknownRequest(String),

    #[error("invalid request parameters: {0}")]
    InvalidParams(String),
}
