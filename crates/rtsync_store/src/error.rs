//! Error types for the store.

use crate::table::Table;
use crate::types::{RowId, TxnId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store connection is down.
    #[error("not connected to the store")]
    NotConnected,

    /// A write names a row that does not exist.
    #[error("unknown row {row_id} in table {table}")]
    UnknownRow {
        /// Table of the row.
        table: Table,
        /// The missing row.
        row_id: RowId,
    },

    /// A transaction was used after it was committed or aborted.
    #[error("transaction {txn} is no longer active")]
    TransactionClosed {
        /// The transaction.
        txn: TxnId,
    },

    /// A row is not among the rows inserted by a transaction.
    #[error("row {0} was not inserted by this transaction")]
    UnknownTransactionRow(RowId),

    /// A transaction ID is not known to the store.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),

    /// A column value has the wrong shape.
    #[error("type mismatch in {table}.{column}: {message}")]
    TypeMismatch {
        /// Table of the column.
        table: Table,
        /// Column name.
        column: String,
        /// What was wrong.
        message: String,
    },

    /// The seed document could not be read.
    #[error("seed I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The seed document could not be parsed.
    #[error("seed parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The seed document is structurally invalid.
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
}

impl StoreError {
    /// Creates a type mismatch error.
    pub fn type_mismatch(table: Table, column: &str, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            table,
            column: column.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid seed error.
    pub fn invalid_seed(message: impl Into<String>) -> Self {
        Self::InvalidSeed(message.into())
    }

    /// Returns true if the failure may clear up on its own (reconnect,
    /// fresh snapshot).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::NotConnected | StoreError::UnknownRow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(StoreError::NotConnected.is_transient());
        assert!(StoreError::UnknownRow {
            table: Table::BgpRouter,
            row_id: RowId::new(),
        }
        .is_transient());
        assert!(!StoreError::invalid_seed("no tables").is_transient());
    }

    #[test]
    fn error_display() {
        let err = StoreError::type_mismatch(Table::BgpRouter, "asn", "expected integer");
        assert_eq!(
            err.to_string(),
            "type mismatch in BGP_Router.asn: expected integer"
        );
        assert_eq!(
            StoreError::TransactionClosed { txn: TxnId::new(3) }.to_string(),
            "transaction txn:3 is no longer active"
        );
    }
}
