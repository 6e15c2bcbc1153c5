//! Error types for Tabular
//!
//! This module defines the errors surfaced to callers of the query service.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Cache-layer failures are deliberately absent: they never leave the
//! [`cache`](crate::cache) module and degrade to a miss instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Tabular operations
#[derive(Error, Debug)]
pub enum TabularError {
    /// Malformed pagination, sort, or table input
    #[error("Invalid query: {0}")]
    InvalidQuerySpec(String),

    /// Requested table does not exist in the resource
    #[error("Table '{table}' not found. Available tables: {}", available.join(", "))]
    TableNotFound {
        /// Requested table name
        table: String,
        /// Tables that do exist, for discoverability
        available: Vec<String>,
    },

    /// Canonical source for a resource could not be found or fetched
    #[error("Resource '{resource_id}' is unavailable: {reason}")]
    ResourceUnavailable {
        /// Resource identifier
        resource_id: String,
        /// Human-readable cause
        reason: String,
    },

    /// Resource is not backed by any real data path yet
    #[error("Resource '{0}' is not provisioned")]
    ResourceNotProvisioned(String),

    /// Backing table store could not be opened
    #[error("Store unavailable at {}: {reason}", path.display())]
    StoreUnavailable {
        /// Path of the store
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// Query failed during preparation or execution
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for Tabular operations
pub type Result<T> = std::result::Result<T, TabularError>;

impl TabularError {
    /// Returns true if retrying the same request later may succeed.
    ///
    /// Spec and lookup errors are permanent for the given input; resource and
    /// I/O errors depend on state outside the request.
    #[cold]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TabularError::ResourceUnavailable { .. }
                | TabularError::ResourceNotProvisioned(_)
                | TabularError::StoreUnavailable { .. }
                | TabularError::QueryExecution(_)
                | TabularError::Io(_)
        )
    }

    /// Stable machine-readable code for the transport layer.
    #[cold]
    pub fn code(&self) -> &'static str {
        match self {
            TabularError::InvalidQuerySpec(_) => "INVALID_QUERY",
            TabularError::TableNotFound { .. } => "TABLE_NOT_FOUND",
            TabularError::ResourceUnavailable { .. } => "RESOURCE_UNAVAILABLE",
            TabularError::ResourceNotProvisioned(_) => "RESOURCE_NOT_PROVISIONED",
            TabularError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            TabularError::QueryExecution(_) => "QUERY_EXECUTION",
            TabularError::Config(_) => "CONFIG",
            TabularError::Io(_) => "IO",
        }
    }

    pub(crate) fn store_unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        TabularError::StoreUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn resource_unavailable(resource_id: &str, reason: impl ToString) -> Self {
        TabularError::ResourceUnavailable {
            resource_id: resource_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for TabularError {
    fn from(err: rusqlite::Error) -> Self {
        TabularError::QueryExecution(err.to_string())
    }
}
