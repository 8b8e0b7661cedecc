//! Error types for the tenant limiter service.

use thiserror::Error;

/// Main error type for tenant limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input, e.g. a malformed rule or an out-of-range bypass duration
    #[error("Validation error: {0}")]
    Validation(String),

    /// A requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write would violate a uniqueness invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Window store failures that are not Redis protocol errors
    #[error("Store error: {0}")]
    Store(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether the error comes from an unavailable backing store rather than
    /// from the caller's input.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            LimiterError::Store(_) | LimiterError::Redis(_) | LimiterError::Database(_)
        )
    }
}

/// Result type alias for tenant limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(LimiterError::Store("down".into()).is_unavailable());
        assert!(!LimiterError::Validation("bad".into()).is_unavailable());
        assert!(!LimiterError::Conflict("dup".into()).is_unavailable());
    }

    #[test]
    fn test_display() {
        let err = LimiterError::NotFound("rule 42".into());
        assert_eq!(err.to_string(), "Not found: rule 42");
    }
}
