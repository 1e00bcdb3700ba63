//! Error types for the MAPI crates
//!
//! This module provides the consolidated error type shared by the codec,
//! the transport and the session layer.

use std::io;
use thiserror::Error;

/// MAPI error type
#[derive(Error, Debug)]
pub enum MapiError {
    /// Network error (unreachable host, reset, timeout)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Authentication error (bad credentials or unsupported digest)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Malformed or unexpected message from the server
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cell that does not parse as its declared column type
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Caller misuse of the session or a cursor
    #[error("State error: {0}")]
    State(String),

    /// Error reported by the database engine
    #[error("Server error [{code}]: {message}")]
    Server {
        /// SQLSTATE reported by the server (may be empty)
        code: String,

        /// Error message
        message: String,

        /// Statement that caused the error, if known
        sql: Option<String>,
    },

    /// The session has been closed or invalidated
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid connection parameters
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MapiError {
    /// Whether this error terminates the session.
    ///
    /// State and server errors leave the session usable; everything that
    /// means the byte stream can no longer be trusted does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MapiError::Network(_) | MapiError::Auth(_) | MapiError::Protocol(_)
        )
    }

    /// Attach the offending statement to a server error.
    ///
    /// Other variants are returned unchanged.
    pub fn with_sql(self, statement: &str) -> Self {
        match self {
            MapiError::Server { code, message, sql: None } => MapiError::Server {
                code,
                message,
                sql: Some(statement.to_string()),
            },
            other => other,
        }
    }

    /// The statement attached to a server error
    pub fn sql(&self) -> Option<&str> {
        match self {
            MapiError::Server { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

/// Result type for the MAPI crates
pub type Result<T> = std::result::Result<T, MapiError>;

/// Convert a displayable error to a protocol error
pub fn to_protocol_error<E: std::fmt::Display>(err: E) -> MapiError {
    MapiError::Protocol(err.to_string())
}

/// Convert a displayable error to a configuration error
pub fn to_config_error<E: std::fmt::Display>(err: E) -> MapiError {
    MapiError::Config(err.to_string())
}

/// Build a timeout error for the given operation
pub fn timeout_error(operation: &str) -> MapiError {
    MapiError::Network(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out", operation),
    ))
}
