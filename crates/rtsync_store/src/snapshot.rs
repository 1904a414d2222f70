//! Immutable, versioned views of the store.

use crate::row::{Row, Tombstone};
use crate::table::Table;
use crate::types::{RowId, SequenceNumber};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An immutable view of all tables as of one sequence number.
///
/// Snapshots are produced by the store and shared read-only with every
/// reader of a reconciliation pass. Rows are reference counted so that
/// successive snapshots share unchanged rows.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    seq: SequenceNumber,
    tables: HashMap<Table, BTreeMap<RowId, Arc<Row>>>,
    tombstones: Vec<Tombstone>,
}

impl Snapshot {
    /// Creates an empty snapshot at sequence zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the sequence number of this snapshot.
    #[must_use]
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Iterates over the live rows of a table, in row-id order.
    pub fn rows(&self, table: Table) -> impl Iterator<Item = &Arc<Row>> {
        self.tables.get(&table).into_iter().flat_map(|t| t.values())
    }

    /// Number of live rows in a table.
    #[must_use]
    pub fn row_count(&self, table: Table) -> usize {
        self.tables.get(&table).map_or(0, BTreeMap::len)
    }

    /// True if the table has no live rows.
    #[must_use]
    pub fn is_empty(&self, table: Table) -> bool {
        self.row_count(table) == 0
    }

    /// Returns a live row by ID.
    #[must_use]
    pub fn get(&self, table: Table, id: RowId) -> Option<&Arc<Row>> {
        self.tables.get(&table).and_then(|t| t.get(&id))
    }

    /// Returns a live row, or the last value of a deleted row.
    ///
    /// Used to resolve references held by rows that were deleted together
    /// with (or after) the row they point to.
    #[must_use]
    pub fn resolve(&self, table: Table, id: RowId) -> Option<&Arc<Row>> {
        self.get(table, id).or_else(|| {
            self.tombstones
                .iter()
                .rev()
                .find(|t| t.row.table() == table && t.row.id() == id)
                .map(|t| &t.row)
        })
    }

    /// Iterates over the tombstones of a table.
    pub fn tombstones(&self, table: Table) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.iter().filter(move |t| t.row.table() == table)
    }

    /// Number of retained tombstones across all tables.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Builds the successor snapshot. Used by store implementations.
    pub(crate) fn advance(&self, seq: SequenceNumber) -> Self {
        Self {
            seq,
            tables: self.tables.clone(),
            tombstones: self.tombstones.clone(),
        }
    }

    pub(crate) fn put_row(&mut self, row: Row) {
        self.tables
            .entry(row.table())
            .or_default()
            .insert(row.id(), Arc::new(row));
    }

    pub(crate) fn remove_row(&mut self, table: Table, id: RowId) -> Option<Arc<Row>> {
        self.tables.get_mut(&table).and_then(|t| t.remove(&id))
    }

    pub(crate) fn push_tombstone(&mut self, tombstone: Tombstone) {
        self.tombstones.push(tombstone);
    }

    pub(crate) fn clear_table(&mut self, table: Table) {
        self.tables.remove(&table);
        self.tombstones.retain(|t| t.row.table() != table);
    }

    pub(crate) fn oldest_tombstone(&self) -> Option<SequenceNumber> {
        self.tombstones.iter().map(|t| t.deleted_at).min()
    }

    pub(crate) fn prune_tombstones(&mut self, before: SequenceNumber) -> usize {
        let len = self.tombstones.len();
        self.tombstones.retain(|t| t.deleted_at >= before);
        len - self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(table: Table, seq: u64) -> Row {
        let mut columns = BTreeMap::new();
        columns.insert("name".to_string(), Value::text("eth0"));
        Row::new(RowId::new(), table, columns, SequenceNumber::new(seq))
    }

    #[test]
    fn empty_snapshot() {
        let snap = Snapshot::empty();
        assert_eq!(snap.seq(), SequenceNumber::ZERO);
        assert!(snap.is_empty(Table::BgpRouter));
        assert_eq!(snap.rows(Table::BgpRouter).count(), 0);
    }

    #[test]
    fn advance_shares_rows() {
        let mut s1 = Snapshot::empty().advance(SequenceNumber::new(1));
        let r = row(Table::OspfInterface, 1);
        let id = r.id();
        s1.put_row(r);

        let s2 = s1.advance(SequenceNumber::new(2));
        assert!(Arc::ptr_eq(
            s1.get(Table::OspfInterface, id).unwrap(),
            s2.get(Table::OspfInterface, id).unwrap()
        ));
    }

    #[test]
    fn resolve_finds_tombstones() {
        let mut snap = Snapshot::empty().advance(SequenceNumber::new(1));
        let r = row(Table::BgpRouter, 1);
        let id = r.id();
        snap.put_row(r);

        let mut next = snap.advance(SequenceNumber::new(2));
        let removed = next.remove_row(Table::BgpRouter, id).unwrap();
        next.push_tombstone(Tombstone {
            row: removed,
            deleted_at: SequenceNumber::new(2),
        });

        assert!(next.get(Table::BgpRouter, id).is_none());
        assert!(next.resolve(Table::BgpRouter, id).is_some());
        assert_eq!(next.tombstones(Table::BgpRouter).count(), 1);

        assert_eq!(next.prune_tombstones(SequenceNumber::new(3)), 1);
        assert!(next.resolve(Table::BgpRouter, id).is_none());
    }
}
