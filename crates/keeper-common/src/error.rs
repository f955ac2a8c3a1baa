//! Error types for keeper

use thiserror::Error;

/// Result type alias for keeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Main error type for keeper
///
/// The first five variants are the pipeline's failure taxonomy. None of them
/// is retried: the offending record or task is logged and dropped.
#[derive(Error, Debug)]
pub enum KeeperError {
    /// Malformed row, missing name field, too-short record
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown list or schema id
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// Staging write/read failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload cannot be tokenized in the announced format
    #[error("Format error: {0}")]
    Format(String),

    /// No cached value arrived within the wait budget
    #[error("Data for '{0}' is not yet available")]
    CacheTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl KeeperError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Transient errors are worth a later re-upload; the rest never succeed
    /// unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Database(_) | Self::CacheTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = KeeperError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_transient());
        assert!(KeeperError::CacheTimeout("R1".into()).is_transient());
        assert!(!KeeperError::validation("short row").is_transient());
        assert!(!KeeperError::lookup("no list").is_transient());
    }

    #[test]
    fn test_cache_timeout_message() {
        let err = KeeperError::CacheTimeout("TL072".to_string());
        assert_eq!(err.to_string(), "Data for 'TL072' is not yet available");
    }
}
