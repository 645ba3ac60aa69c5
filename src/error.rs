// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay.
//!
//! Errors are categorized by their source (broker, checkpoint store,
//! collaborators) and carry enough context to be logged on their own.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Network errors, timeouts, connection failures |
//! | `StreamNotFound` | Yes | Stream not provisioned yet |
//! | `Export` | Yes | Bulk export interrupted |
//! | `Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `CheckpointStorage` | No | Offset cannot be represented by the store |
//! | `Config` | No | Configuration invalid |
//! | `StreamParse` | No | Malformed stream entry |
//! | `InvalidState` | No | Consumer state machine violation |
//!
//! Codec, lookup and sink failures never surface here: the mapper treats a
//! bad blob as absent data and the dispatcher turns collaborator failures
//! into a per-event outcome.
//!
//! # Retry Behavior
//!
//! The stream consumer treats every setup failure as transient regardless
//! of category; [`RelayError::is_retryable()`] is used to pick the log
//! level and the metric label, not to give up.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Boxed future returned by the relay's async trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker connection or command error.
    ///
    /// Occurs when talking to the stream broker. Typically retryable
    /// (network timeouts, connection drops).
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The subscribed stream does not exist (yet).
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// Checkpoint store rejected a value it cannot represent.
    #[error("Checkpoint storage error: {0}")]
    CheckpointStorage(String),

    /// Bulk export failed.
    #[error("Export error: {0}")]
    Export(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream entry has an unexpected shape.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Consumer state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl RelayError {
    /// Create a broker error from a redis::RedisError
    pub fn broker(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::StreamNotFound(_) => true, // Stream may be created later
            Self::Export(_) => true,
            Self::Checkpoint(_) => false,
            Self::CheckpointStorage(_) => false,
            Self::Config(_) => false,
            Self::StreamParse(_) => false,
            Self::InvalidState { .. } => false,
        }
    }
}
