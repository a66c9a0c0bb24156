//! WolfCache Error Types

use thiserror::Error;

/// Result type alias for WolfCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCache error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Catalog errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Replication control errors
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Manual(String),

    #[error("Busy: {0}")]
    Busy(String),

    // Binlog errors
    #[error("Binlog exhausted")]
    Exhaust,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Store errors
    #[error("Store {0} does not exist")]
    UnknownStore(u32),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::NotFound("catalog row not found".to_string())
            }
            other => Error::Catalog(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout("wait".into()).is_retryable());
        assert!(!Error::Manual("store not empty".into()).is_retryable());
        assert!(!Error::Busy("already attached".into()).is_retryable());
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
