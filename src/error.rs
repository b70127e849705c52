//! Error types for the Floodgate engine.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Runtime throttling paths never fail: a blocked request is a decision,
/// not an error. Errors surface only when constructing components from
/// configuration or when loading configuration files.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration values rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration parse errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
