//! Error types for the card ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Integrity findings (hash, link, balance) are never errors; they are
/// reported as [`crate::audit::Issue`] entries.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Event rejected at ingestion (missing station, negative fare, ...)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// Card not found
    #[error("Card not found: {0}")]
    CardNotFound(String),

    /// Merkle root requested for a chain without events
    #[error("Empty chain: {0}")]
    EmptyChain(String),

    /// Concurrency error (task panicked or was cancelled)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Concurrency(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Other(format!("Metrics error: {}", err))
    }
}
