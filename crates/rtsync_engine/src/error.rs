//! Error types for the engine.

use crate::runtime::RuntimeError;
use rtsync_store::{CommitStatus, StoreError, Table};
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while reconciling or publishing.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Store client error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Protocol runtime error.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A configuration column could not be interpreted.
    #[error("malformed {table}.{column}: {message}")]
    MalformedInput {
        /// Table of the row.
        table: Table,
        /// Offending column.
        column: String,
        /// What was wrong.
        message: String,
    },

    /// No row with the given key.
    #[error("no {table} row for {key}")]
    MissingRow {
        /// Table searched.
        table: Table,
        /// Key looked up.
        key: String,
    },

    /// A route state change that would expose an inconsistent state.
    #[error("route {prefix} cannot be marked {action} while selected={selected}")]
    RouteStateViolation {
        /// Route prefix.
        prefix: String,
        /// `announce` or `withdraw`.
        action: &'static str,
        /// The route's current selected flag.
        selected: bool,
    },

    /// A transaction was requested while another is open.
    #[error("a transaction is already open")]
    TransactionAlreadyOpen,

    /// The store did not apply a transaction.
    #[error("transaction failed: {status:?}")]
    TransactionFailed {
        /// Commit status.
        status: CommitStatus,
    },

    /// Commits are paused after an error.
    #[error("commit backoff active for another {remaining:?}")]
    BackoffActive {
        /// Time left.
        remaining: Duration,
    },

    /// The store's wait conditions could not be registered.
    #[error("wait registration failed: {0}")]
    Registration(String),
}

impl EngineError {
    /// Creates a malformed-input error.
    pub fn malformed(table: Table, column: &str, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            table,
            column: column.to_string(),
            message: message.into(),
        }
    }

    /// Creates a missing-row error.
    pub fn missing(table: Table, key: impl std::fmt::Display) -> Self {
        Self::MissingRow {
            table,
            key: key.to_string(),
        }
    }

    /// Returns true for failures that a later pass retries on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::TransactionFailed { .. }
            | EngineError::BackoffActive { .. }
            | EngineError::Registration(_) => true,
            _ => false,
        }
    }

    /// Returns true for invariant violations by the caller.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            EngineError::RouteStateViolation { .. } | EngineError::TransactionAlreadyOpen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::TransactionFailed {
            status: CommitStatus::Contended
        }
        .is_transient());
        assert!(EngineError::Store(StoreError::NotConnected).is_transient());
        assert!(!EngineError::malformed(Table::Route, "prefix", "bad").is_transient());

        let violation = EngineError::RouteStateViolation {
            prefix: "10.0.0.0/8".into(),
            action: "withdraw",
            selected: true,
        };
        assert!(violation.is_programming_error());
        assert!(!violation.is_transient());
    }

    #[test]
    fn error_display() {
        let err = EngineError::missing(Table::BgpRouter, 65001);
        assert_eq!(err.to_string(), "no BGP_Router row for 65001");

        let err = EngineError::malformed(Table::Route, "prefix", "host bits set");
        assert_eq!(err.to_string(), "malformed Route.prefix: host bits set");
    }
}
