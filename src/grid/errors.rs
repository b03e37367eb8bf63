//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid level not found: index {0}")]
    LevelNotFound(u32),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Exchange call timed out: {0}")]
    Timeout(String),

    #[error("Command rejected: {0}")]
    Validation(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Corrupt state snapshot {path}: {reason}")]
    CorruptState { path: String, reason: String },

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Command log error: {0}")]
    CommandLog(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Network, timeout and rate-limit failures: retried next cycle, never fatal
    pub fn is_transient(&self) -> bool {
        matches!(self, GridError::Exchange(_) | GridError::Timeout(_))
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GridError::Exchange("rate limited".into()).is_transient());
        assert!(GridError::Timeout("get_price".into()).is_transient());
        assert!(!GridError::Validation("bad level".into()).is_transient());
        assert!(!GridError::InvariantViolation("dup".into()).is_transient());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let err: GridError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, GridError::StatePersistence(_)));
    }
}
