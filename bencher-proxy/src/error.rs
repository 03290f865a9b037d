//! Common error types for bencher-proxy.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for bencher-proxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors from the pull transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Websocket errors from the push transport
    #[error("websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file errors
    #[error("configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration validation errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream protocol or availability errors
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
