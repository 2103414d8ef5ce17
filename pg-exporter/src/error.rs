//! Error types for the exporter.
//!
//! Only [`ConfigError`] is fatal. Everything else is caught at the collector
//! boundary and reported through the exporter's own metrics.

use std::time::Duration;

use thiserror::Error;

/// Startup configuration errors (config file, data source, query catalog).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid data source URL: {0}")]
    DataSource(String),

    #[error("Invalid query '{query}': {message}")]
    Query { query: String, message: String },
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a catalog error for a named query.
    pub fn query(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            query: query.into(),
            message: message.into(),
        }
    }
}

/// The database could not be reached.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Connection to '{database}' failed: {message}")]
    Connect { database: String, message: String },

    #[error("Connection to '{database}' timed out after {timeout:?}")]
    Timeout { database: String, timeout: Duration },

    #[error("Connection pool for '{database}' is closed")]
    Closed { database: String },
}

/// A single query failed. Isolated to that query's samples for the cycle.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Column '{0}' missing from result set")]
    MissingColumn(String),
}

impl QueryError {
    /// Whether the failure means the database itself is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, QueryError::Connection(_))
    }
}

/// A sample could not be rendered in the exposition format.
#[derive(Debug, Clone, Error)]
pub enum SerializationError {
    #[error("Metric '{metric}' has non-finite value {value}")]
    NonFinite { metric: String, value: f64 },
}

/// Errors returned when starting a collection cycle.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("A collection cycle is already running")]
    AlreadyRunning,
}
