//! Error types for the pulse_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pulse_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The sensor host lacks a metric type the session needs
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Session id is the zero sentinel
    #[error("Invalid session id: {0}")]
    InvalidSession(i64),

    /// The sensor host rejected or failed a request
    #[error("Sensor host error: {0}")]
    Host(String),

    /// A paired node could not be reached or rejected a message
    #[error("Delivery failure: {0}")]
    Delivery(String),

    /// Wire message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// State management error
    #[error("State error: {0}")]
    State(String),
}
