//! Write transactions.

use crate::error::{StoreError, StoreResult};
use crate::row::Row;
use crate::table::Table;
use crate::types::{RowId, SequenceNumber, TxnId};
use crate::value::Value;
use std::collections::BTreeMap;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is open and accepts writes.
    Active,
    /// Transaction has been handed to the store for commit.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// A pending write in a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Insert a new row.
    Insert {
        /// Table of the new row.
        table: Table,
        /// Column values of the new row.
        columns: BTreeMap<String, Value>,
    },
    /// Update columns of an existing row. `Null` clears a column.
    Update {
        /// Table of the row.
        table: Table,
        /// Column replacements.
        columns: BTreeMap<String, Value>,
    },
    /// Delete an existing row.
    Delete {
        /// Table of the row.
        table: Table,
    },
}

/// An open write transaction.
///
/// Every row a transaction mutates is recorded in its read set together
/// with the `modified_at` marker observed in the snapshot it was derived
/// from. The store rejects the commit as contended if any of those rows
/// moved in the meantime, so a transaction never writes on top of state it
/// did not see.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    base_seq: SequenceNumber,
    state: TransactionState,
    writes: BTreeMap<RowId, PendingWrite>,
    reads: BTreeMap<RowId, SequenceNumber>,
}

impl Transaction {
    /// Creates a transaction based on the snapshot at `base_seq`.
    pub fn new(id: TxnId, base_seq: SequenceNumber) -> Self {
        Self {
            id,
            base_seq,
            state: TransactionState::Active,
            writes: BTreeMap::new(),
            reads: BTreeMap::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Sequence number of the snapshot this transaction was derived from.
    #[must_use]
    pub fn base_seq(&self) -> SequenceNumber {
        self.base_seq
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction still accepts writes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Records the insertion of a new row and returns its ID.
    pub fn insert(
        &mut self,
        table: Table,
        columns: BTreeMap<String, Value>,
    ) -> StoreResult<RowId> {
        self.ensure_active()?;
        let id = RowId::new();
        self.writes.insert(id, PendingWrite::Insert { table, columns });
        Ok(id)
    }

    /// Records a column replacement on an existing row.
    ///
    /// Several updates to the same row within one transaction merge. An
    /// update to a row inserted by this transaction amends the insert.
    pub fn update(&mut self, row: &Row, column: &str, value: Value) -> StoreResult<()> {
        self.ensure_active()?;
        self.record_read(row);
        match self.writes.get_mut(&row.id()) {
            Some(PendingWrite::Update { columns, .. }) => {
                columns.insert(column.to_string(), value);
            }
            Some(PendingWrite::Insert { columns, .. }) => {
                columns.insert(column.to_string(), value);
            }
            Some(PendingWrite::Delete { .. }) => {}
            None => {
                let mut columns = BTreeMap::new();
                columns.insert(column.to_string(), value);
                self.writes.insert(
                    row.id(),
                    PendingWrite::Update {
                        table: row.table(),
                        columns,
                    },
                );
            }
        }
        Ok(())
    }

    /// Sets a column on a row inserted earlier in this transaction.
    pub fn amend_insert(&mut self, id: RowId, column: &str, value: Value) -> StoreResult<()> {
        self.ensure_active()?;
        match self.writes.get_mut(&id) {
            Some(PendingWrite::Insert { columns, .. }) => {
                if value.is_null() {
                    columns.remove(column);
                } else {
                    columns.insert(column.to_string(), value);
                }
                Ok(())
            }
            _ => Err(StoreError::UnknownTransactionRow(id)),
        }
    }

    /// Drops a row inserted earlier in this transaction.
    pub fn discard_insert(&mut self, id: RowId) -> StoreResult<()> {
        self.ensure_active()?;
        match self.writes.get(&id) {
            Some(PendingWrite::Insert { .. }) => {
                self.writes.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::UnknownTransactionRow(id)),
        }
    }

    /// Records the deletion of an existing row.
    pub fn delete(&mut self, row: &Row) -> StoreResult<()> {
        self.ensure_active()?;
        self.record_read(row);
        self.writes
            .insert(row.id(), PendingWrite::Delete { table: row.table() });
        Ok(())
    }

    /// Records the observed version of a row for contention detection.
    pub fn record_read(&mut self, row: &Row) {
        self.reads.entry(row.id()).or_insert(row.modified_at());
    }

    /// Returns all pending writes, in row-id order.
    pub fn pending_writes(&self) -> impl Iterator<Item = (&RowId, &PendingWrite)> {
        self.writes.iter()
    }

    /// Returns the number of pending writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Returns the read set.
    pub fn read_set(&self) -> impl Iterator<Item = (&RowId, &SequenceNumber)> {
        self.reads.iter()
    }

    /// Marks the transaction as committed.
    pub fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    /// Marks the transaction as aborted.
    pub fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    fn ensure_active(&self) -> StoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed | TransactionState::Aborted => {
                Err(StoreError::TransactionClosed { txn: self.id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor_row() -> Row {
        let mut columns = BTreeMap::new();
        columns.insert("ip_address".to_string(), Value::text("10.0.0.2"));
        Row::new(
            RowId::new(),
            Table::BgpNeighbor,
            columns,
            SequenceNumber::new(4),
        )
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = Transaction::new(TxnId::new(1), SequenceNumber::new(4));
        assert!(txn.is_active());
        assert_eq!(txn.base_seq(), SequenceNumber::new(4));
        assert_eq!(txn.write_count(), 0);
    }

    #[test]
    fn updates_to_same_row_merge() {
        let row = neighbor_row();
        let mut txn = Transaction::new(TxnId::new(1), SequenceNumber::new(4));
        txn.update(&row, "status", Value::map([("bgp_peer_state", Value::text("idle"))]))
            .unwrap();
        txn.update(&row, "statistics", Value::map([("established_count", Value::from(1i64))]))
            .unwrap();

        assert_eq!(txn.write_count(), 1);
        match txn.pending_writes().next().unwrap().1 {
            PendingWrite::Update { columns, .. } => assert_eq!(columns.len(), 2),
            other => panic!("unexpected write {other:?}"),
        }
        let reads: Vec<_> = txn.read_set().collect();
        assert_eq!(reads, vec![(&row.id(), &SequenceNumber::new(4))]);
    }

    #[test]
    fn amend_insert() {
        let mut txn = Transaction::new(TxnId::new(1), SequenceNumber::ZERO);
        let id = txn.insert(Table::OspfRoute, BTreeMap::new()).unwrap();
        txn.amend_insert(id, "prefix", Value::text("10.1.0.0/16")).unwrap();
        assert!(txn.amend_insert(RowId::new(), "prefix", Value::Null).is_err());

        txn.discard_insert(id).unwrap();
        assert_eq!(txn.write_count(), 0);
        assert!(txn.discard_insert(id).is_err());
    }

    #[test]
    fn closed_transaction_rejects_writes() {
        let row = neighbor_row();
        let mut txn = Transaction::new(TxnId::new(9), SequenceNumber::new(4));
        txn.mark_aborted();
        assert!(matches!(
            txn.delete(&row),
            Err(StoreError::TransactionClosed { .. })
        ));
    }
}
