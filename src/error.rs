//! Error types for the data access block.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver failures are carried unchanged as the error source; everything raised by this
//! crate itself (configuration, capability, argument and lifecycle errors) gets its own
//! variant with an actionable message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// Raised by the underlying driver; propagated as-is.
    #[error(transparent)]
    Driver(#[from] sqlx::Error),

    #[error("The database type \"{database_kind}\" does not support asynchronous operations")]
    AsyncNotSupported { database_kind: String },

    #[error("Invalid argument '{argument}': {message}")]
    InvalidArgument { argument: String, message: String },

    #[error(
        "The database provider factory is already set. Pass throw_if_set = false to replace it."
    )]
    FactoryAlreadySet,

    #[error(
        "The database provider factory has not been set. Install one with DatabaseFactory::set_databases first."
    )]
    FactoryNotSet,

    #[error("The connection has already been disposed")]
    ConnectionDisposed,

    #[error("The connection is busy with an open reader")]
    ConnectionBusy,

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Row mapping failed: {message}")]
    Mapping { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a capability error for a database kind without async support.
    pub fn async_not_supported(database_kind: impl Into<String>) -> Self {
        Self::AsyncNotSupported {
            database_kind: database_kind.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(argument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a row mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error came from resolving configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Get a suggestion for this error, if one can be given.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion.clone()),
            Self::Driver(err) => driver_suggestion(err),
            Self::AsyncNotSupported { .. } => {
                Some("Use the synchronous execute methods for this provider".to_string())
            }
            Self::ConnectionBusy => Some(
                "Read the open reader to the end or close it before running another command on the connection"
                    .to_string(),
            ),
            Self::FactoryNotSet => Some(
                "Call DatabaseFactory::set_provider_factory during application start-up"
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Derive a hint from a driver error message.
fn driver_suggestion(error: &sqlx::Error) -> Option<String> {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return Some("Check that the database server is running and accessible".to_string());
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return Some("Verify the username and password in the connection string".to_string());
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return Some("Check that the database name exists".to_string());
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return Some("Check TLS/SSL configuration or try disabling it".to_string());
    }

    match error {
        sqlx::Error::Database(_) => Some("Check the SQL syntax and referenced objects".to_string()),
        sqlx::Error::RowNotFound => {
            Some("Verify the query conditions match existing data".to_string())
        }
        _ => None,
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
