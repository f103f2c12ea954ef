/// Unified error handling for sqlx-router
///
/// This module provides the error type system shared by the topology store,
/// the load balancers, the routing rules and the connection proxy.

use std::fmt;
use thiserror::Error;

/// Main error type for sqlx-router operations
#[derive(Debug, Clone, Error)]
pub enum SqlXError {
    /// Invalid topology or configuration file
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An admin mutation failed revalidation
    #[error("Management error in {operation} ({}): {source}", rollback_note(.rolled_back))]
    Management {
        operation: String,
        source: Box<SqlXError>,
        rolled_back: bool,
    },

    /// No eligible node for the statement
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Surface method the proxy cannot implement
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Failure reported by the physical driver
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Operation on a closed connection, statement or result set
    #[error("{resource} is closed")]
    Closed { resource: &'static str },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "rolled back"
    } else {
        "not rolled back"
    }
}

/// Configuration-specific errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        ConfigError::ValidationError(message.into())
    }
}

/// Error raised by a physical database connection, statement or result set.
///
/// The proxy records a clone of it and hands the original back to the caller
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DatabaseError {
    pub message: String,
    pub sql_state: Option<String>,
    pub vendor_code: i32,
}

impl DatabaseError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            vendor_code: 0,
        }
    }

    pub fn with_sql_state<S: Into<String>>(mut self, sql_state: S) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn with_vendor_code(mut self, vendor_code: i32) -> Self {
        self.vendor_code = vendor_code;
        self
    }
}

/// Result type alias for sqlx-router operations
pub type SqlXResult<T> = Result<T, SqlXError>;

/// Result type alias for calls into the physical driver
pub type DbResult<T> = Result<T, DatabaseError>;

/// Convenience methods for creating specific error types
impl SqlXError {
    /// Create a configuration validation error
    pub fn config<S: Into<String>>(message: S) -> Self {
        SqlXError::Config(ConfigError::validation(message))
    }

    /// Wrap a failed admin mutation
    pub fn management<S: Into<String>>(operation: S, source: SqlXError, rolled_back: bool) -> Self {
        SqlXError::Management {
            operation: operation.into(),
            source: Box::new(source),
            rolled_back,
        }
    }

    /// Create a routing error
    pub fn routing<S: Into<String>>(message: S) -> Self {
        SqlXError::Routing {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        SqlXError::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a database error from a message
    pub fn database<S: Into<String>>(message: S) -> Self {
        SqlXError::Database(DatabaseError::new(message))
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        SqlXError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SqlXError::Internal {
            message: message.into(),
        }
    }

    /// True when an admin mutation failed and the previous topology is still in place
    pub fn is_rolled_back(&self) -> bool {
        matches!(self, SqlXError::Management { rolled_back: true, .. })
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            SqlXError::Database(_) => true,
            SqlXError::Routing { .. } => true,
            SqlXError::Timeout { .. } => true,
            SqlXError::Management { rolled_back, .. } => *rolled_back,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SqlXError::Config(_) => ErrorSeverity::Critical,
            SqlXError::Internal { .. } => ErrorSeverity::Critical,
            SqlXError::Management { rolled_back: false, .. } => ErrorSeverity::Critical,
            SqlXError::Database(_) => ErrorSeverity::Warning,
            SqlXError::Routing { .. } => ErrorSeverity::Warning,
            SqlXError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
