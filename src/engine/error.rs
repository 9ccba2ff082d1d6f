// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the federation engine
//!
//! Every stage (parsing, resolution, backend access, merging) reports one of
//! these variants. Query execution wraps whatever failed into a [`QueryError`]
//! that also carries the elapsed wall-clock time.

use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Table '{table}' is not present in the table mapping")]
    UnknownTable { table: String },

    #[error(
        "Ambiguous table '{table}': several mapped tables match ({}). Qualify it with a schema.",
        candidates.join(", ")
    )]
    AmbiguousTable {
        table: String,
        candidates: Vec<String>,
    },

    #[error("Connection to '{backend}' failed: {message}")]
    ConnectionFailed { backend: String, message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Driver not found: {driver_id}")]
    DriverNotFound { driver_id: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Credential store error: {message}")]
    Credentials { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

impl EngineError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse { message: msg.into() }
    }

    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable {
            table: table.into(),
        }
    }

    pub fn ambiguous_table(table: impl Into<String>, candidates: Vec<String>) -> Self {
        Self::AmbiguousTable {
            table: table.into(),
            candidates,
        }
    }

    pub fn connection_failed(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn driver_not_found(id: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver_id: id.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials { message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io { message: msg.into() }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// A failed federated query: the cause plus the time spent before failing.
///
/// Renders as `"<cause> (execution time: X.XXs)"`.
#[derive(Debug, Error)]
#[error("{source} (execution time: {elapsed_secs:.2}s)")]
pub struct QueryError {
    #[source]
    pub source: EngineError,
    pub elapsed_secs: f64,
}

impl QueryError {
    pub fn new(source: EngineError, elapsed_secs: f64) -> Self {
        Self {
            source,
            elapsed_secs,
        }
    }

    /// The underlying error, for matching on the failure category.
    pub fn kind(&self) -> &EngineError {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_table_lists_every_candidate() {
        let err = EngineError::ambiguous_table(
            "users",
            vec!["public.users".to_string(), "crm.users".to_string()],
        );
        let msg = err.to_string();
        assert!(msg.contains("public.users"));
        assert!(msg.contains("crm.users"));
    }

    #[test]
    fn query_error_reports_elapsed_time() {
        let err = QueryError::new(EngineError::execution_error("boom"), 1.23456);
        assert_eq!(
            err.to_string(),
            "Query execution error: boom (execution time: 1.23s)"
        );
        assert!(matches!(err.kind(), EngineError::ExecutionError { .. }));
    }
}
