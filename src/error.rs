//! # Error Types
//!
//! Custom error types for Fleet Poll using `thiserror`.

use thiserror::Error;

/// Main error type for Fleet Poll
#[derive(Debug, Error)]
pub enum FleetPollError {
    /// Transport-level failure: network error or non-2xx HTTP status
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered 2xx but the envelope declared failure
    #[error("API error: {0}")]
    Api(String),

    /// A decoded value was not the JSON object the endpoint promises
    #[error("Unexpected response shape: {0}")]
    Malformed(String),

    /// Pagination safety cap exceeded before a stop condition was reached
    #[error("Page limit reached after {pages} pages for device {device_id} type {telemetry_type}")]
    PageLimit {
        device_id: String,
        telemetry_type: String,
        pages: u32,
    },

    /// Snapshot integrity failure (e.g. duplicate device ids)
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Fleet Poll
pub type Result<T> = std::result::Result<T, FleetPollError>;
