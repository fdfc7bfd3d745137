// src/error.rs

//! Unified error handling for the collector.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::EntityKind;

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Feed or remote API unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote API rejected the call with a rate-limit response
    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Remote API rejected our credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Inbound record could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Storage rejected a batch because a referenced owner row is missing
    #[error("Referential write error for {kind}: {message}")]
    ReferentialWrite { kind: EntityKind, message: String },

    /// Circuit breaker is open and rejected the call without running it
    #[error("Circuit '{name}' is open")]
    CircuitOpen { name: String },

    /// Storage backend failure that is not a referential error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Reconnect attempts exhausted or another unrecoverable runtime condition
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Crawling error
    #[error("Crawl error for {context}: {message}")]
    Crawl { context: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl fmt::Display) -> Self {
        Self::Connection(message.to_string())
    }

    /// Create a decode error.
    pub fn decode(message: impl fmt::Display) -> Self {
        Self::Decode(message.to_string())
    }

    /// Create a storage error.
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Create a crawl error with context.
    pub fn crawl(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Crawl {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Rate limits are retryable but are tracked separately by the retry
    /// combinator; decode, config and auth failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::WebSocket(_)
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. }
            | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Sqlite(e) => is_busy(e),
            _ => false,
        }
    }

    /// Whether this error must abort startup or the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Validation(_) | Self::Auth(_) | Self::Fatal(_)
        )
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
