//! Rows and their change markers.

use crate::table::Table;
use crate::types::{RowId, SequenceNumber};
use crate::value::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

static NULL: Value = Value::Null;

/// A keyed record of a table.
///
/// Rows are immutable once placed in a snapshot. A write produces a new
/// row value in the next snapshot; readers must therefore identify rows
/// by their declared key columns or by [`RowId`], never by address.
///
/// Besides its columns, a row carries the change markers the change
/// detector classifies against: the sequence number it was inserted at,
/// the sequence number of its last modification, and the sequence number
/// of the last modification of each column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    id: RowId,
    table: Table,
    columns: BTreeMap<String, Value>,
    inserted_at: SequenceNumber,
    modified_at: SequenceNumber,
    column_seq: BTreeMap<String, SequenceNumber>,
}

impl Row {
    /// Creates a row inserted at `seq`.
    pub fn new(
        id: RowId,
        table: Table,
        columns: BTreeMap<String, Value>,
        seq: SequenceNumber,
    ) -> Self {
        let column_seq = columns.keys().map(|k| (k.clone(), seq)).collect();
        Self {
            id,
            table,
            columns,
            inserted_at: seq,
            modified_at: seq,
            column_seq,
        }
    }

    /// Returns a copy of this row with `updates` applied at `seq`.
    ///
    /// Columns whose value does not change keep their previous marker. If
    /// no column changes, the row is returned unchanged.
    #[must_use]
    pub fn with_updates(&self, updates: &BTreeMap<String, Value>, seq: SequenceNumber) -> Self {
        let mut next = self.clone();
        let mut changed = false;
        for (column, value) in updates {
            if next.get(column) == value {
                continue;
            }
            if value.is_null() {
                next.columns.remove(column);
            } else {
                next.columns.insert(column.clone(), value.clone());
            }
            next.column_seq.insert(column.clone(), seq);
            changed = true;
        }
        if changed {
            next.modified_at = seq;
        }
        next
    }

    /// Returns the row ID.
    #[must_use]
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Returns the table of this row.
    #[must_use]
    pub fn table(&self) -> Table {
        self.table
    }

    /// Returns all columns.
    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    /// Returns a column value; absent columns read as `Null`.
    #[must_use]
    pub fn get(&self, column: &str) -> &Value {
        self.columns.get(column).unwrap_or(&NULL)
    }

    /// Returns an integer column.
    #[must_use]
    pub fn integer(&self, column: &str) -> Option<i64> {
        self.get(column).as_integer()
    }

    /// Returns a text column.
    #[must_use]
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).as_text()
    }

    /// Returns a boolean column.
    #[must_use]
    pub fn boolean(&self, column: &str) -> Option<bool> {
        self.get(column).as_bool()
    }

    /// Returns a reference column.
    #[must_use]
    pub fn reference(&self, column: &str) -> Option<RowId> {
        self.get(column).as_row_ref()
    }

    /// Sequence number at which the row was inserted.
    #[must_use]
    pub fn inserted_at(&self) -> SequenceNumber {
        self.inserted_at
    }

    /// Sequence number of the last modification (equals `inserted_at` if
    /// never modified).
    #[must_use]
    pub fn modified_at(&self) -> SequenceNumber {
        self.modified_at
    }

    /// True if the row was inserted after `seq`.
    #[must_use]
    pub fn inserted_since(&self, seq: SequenceNumber) -> bool {
        self.inserted_at > seq
    }

    /// True if the row existed at `seq` and was modified after it.
    #[must_use]
    pub fn modified_since(&self, seq: SequenceNumber) -> bool {
        !self.inserted_since(seq) && self.modified_at > seq
    }

    /// Columns modified after `seq`.
    #[must_use]
    pub fn changed_columns_since(&self, seq: SequenceNumber) -> BTreeSet<String> {
        self.column_seq
            .iter()
            .filter(|(_, s)| **s > seq)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// The last value of a deleted row.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    /// The row as it was when deleted.
    pub row: std::sync::Arc<Row>,
    /// Sequence number of the deleting commit.
    pub deleted_at: SequenceNumber,
}

impl Tombstone {
    /// True if the row was deleted after `seq`.
    #[must_use]
    pub fn deleted_since(&self, seq: SequenceNumber) -> bool {
        self.deleted_at > seq
    }

    /// True if the row was both inserted and deleted after `seq`, so a
    /// reader at `seq` never saw it.
    #[must_use]
    pub fn transient_since(&self, seq: SequenceNumber) -> bool {
        self.row.inserted_since(seq) && self.deleted_since(seq)
    }
}
