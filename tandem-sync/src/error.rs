//! Error types for the sync engine.
//!
//! Nothing in the engine is fatal: transport and store errors are logged by
//! the session driver and folded into [`SyncStatus`](crate::status::SyncStatus).

use thiserror::Error;

/// Wire encoding failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

/// Channel and readiness-probe failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Readiness probe failed: {0}")]
    ProbeFailed(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Baseline persistence and server fetch failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed baseline: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Document not found: {0}")]
    NotFound(String),
}

/// Top-level error for session setup.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Document id must not be empty")]
    EmptyDocumentId,
    #[error("Session closed")]
    SessionClosed,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
