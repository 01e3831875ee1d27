//! Error types for the chat relay

use thiserror::Error;

/// Main error type for relay operations outside the per-request path
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors, including a missing provider credential
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors (bind, serve)
    #[error("Server error: {0}")]
    Server(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
