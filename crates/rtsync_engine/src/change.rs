//! Change detection between snapshot generations.
//!
//! The detector is a thin classification pass over the change markers the
//! store keeps on every row (insertion, last modification, per-column
//! modification, deletion). It never diffs column values itself.

use crate::config::Domains;
use rtsync_store::columns::{
    bgp_neighbor, bgp_router, ospf_area, ospf_interface, ospf_router, route, system,
};
use rtsync_store::{Row, RowId, SequenceNumber, Snapshot, StoreClient, Table};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Row did not exist at the last processed sequence.
    Inserted,
    /// Row existed and some subscribed column changed.
    Modified,
    /// Row existed and is gone.
    Deleted,
}

/// One classified row change.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Table of the row.
    pub table: Table,
    /// Row identity.
    pub row_id: RowId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Subscribed columns that changed. All columns for insertions, none
    /// for deletions.
    pub changed_columns: BTreeSet<String>,
    /// Current row, or its last value for deletions.
    pub row: Arc<Row>,
}

impl ChangeRecord {
    /// True if `column` is among the changed columns.
    #[must_use]
    pub fn changed(&self, column: &str) -> bool {
        self.changed_columns.contains(column)
    }
}

/// The change records of one pass.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    from: SequenceNumber,
    to: SequenceNumber,
    records: Vec<ChangeRecord>,
}

impl ChangeSet {
    /// An empty change set.
    #[must_use]
    pub fn empty(seq: SequenceNumber) -> Self {
        Self {
            from: seq,
            to: seq,
            records: Vec::new(),
        }
    }

    /// Sequence number the changes are relative to.
    #[must_use]
    pub fn from_seq(&self) -> SequenceNumber {
        self.from
    }

    /// Sequence number of the snapshot the changes lead to.
    #[must_use]
    pub fn to_seq(&self) -> SequenceNumber {
        self.to
    }

    /// True if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// All records.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter()
    }

    /// Records of one table and kind.
    pub fn of(&self, table: Table, kind: ChangeKind) -> impl Iterator<Item = &ChangeRecord> {
        self.records
            .iter()
            .filter(move |r| r.table == table && r.kind == kind)
    }

    /// Inserted rows of a table.
    pub fn inserted(&self, table: Table) -> impl Iterator<Item = &ChangeRecord> {
        self.of(table, ChangeKind::Inserted)
    }

    /// Modified rows of a table.
    pub fn modified(&self, table: Table) -> impl Iterator<Item = &ChangeRecord> {
        self.of(table, ChangeKind::Modified)
    }

    /// Deleted rows of a table.
    pub fn deleted(&self, table: Table) -> impl Iterator<Item = &ChangeRecord> {
        self.of(table, ChangeKind::Deleted)
    }

    /// Number of records per kind: (inserted, modified, deleted).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        self.records
            .iter()
            .fold((0, 0, 0), |(i, m, d), r| match r.kind {
                ChangeKind::Inserted => (i + 1, m, d),
                ChangeKind::Modified => (i, m + 1, d),
                ChangeKind::Deleted => (i, m, d + 1),
            })
    }
}

/// The tables and columns the engine reads.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    tables: BTreeMap<Table, BTreeSet<&'static str>>,
}

impl Subscriptions {
    /// No subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds columns of a table.
    pub fn add(&mut self, table: Table, columns: &[&'static str]) -> &mut Self {
        self.tables
            .entry(table)
            .or_default()
            .extend(columns.iter().copied());
        self
    }

    /// The configuration columns of every enabled domain plus the system
    /// marker.
    #[must_use]
    pub fn for_domains(domains: Domains) -> Self {
        let mut subs = Self::new();
        subs.add(Table::System, &[system::CUR_CFG]);
        if domains.bgp {
            subs.add(
                Table::BgpRouter,
                &[
                    bgp_router::ASN,
                    bgp_router::ROUTER_ID,
                    bgp_router::NETWORKS,
                    bgp_router::REDISTRIBUTE,
                    bgp_router::MAXIMUM_PATHS,
                ],
            )
            .add(
                Table::BgpNeighbor,
                &[
                    bgp_neighbor::BGP_ROUTER,
                    bgp_neighbor::IP_ADDRESS,
                    bgp_neighbor::REMOTE_AS,
                    bgp_neighbor::DESCRIPTION,
                    bgp_neighbor::SHUTDOWN,
                ],
            );
        }
        if domains.ospf {
            subs.add(
                Table::OspfRouter,
                &[
                    ospf_router::INSTANCE_TAG,
                    ospf_router::ROUTER_ID,
                    ospf_router::AREAS,
                    ospf_router::REDISTRIBUTE,
                ],
            )
            .add(
                Table::OspfArea,
                &[ospf_area::AREA_ID, ospf_area::AREA_TYPE, ospf_area::AUTH_TYPE],
            )
            .add(
                Table::OspfInterface,
                &[
                    ospf_interface::NAME,
                    ospf_interface::INSTANCE_TAG,
                    ospf_interface::AREA_ID,
                    ospf_interface::HELLO_INTERVAL,
                    ospf_interface::DEAD_INTERVAL,
                    ospf_interface::COST,
                    ospf_interface::PRIORITY,
                    ospf_interface::PASSIVE,
                ],
            );
        }
        if domains.rib {
            subs.add(
                Table::Route,
                &[
                    route::PREFIX,
                    route::FROM,
                    route::NEXTHOPS,
                    route::DISTANCE,
                    route::METRIC,
                ],
            );
        }
        subs
    }

    /// True if the table is subscribed.
    #[must_use]
    pub fn contains(&self, table: Table) -> bool {
        self.tables.contains_key(&table)
    }

    /// Subscribed tables with their columns.
    pub fn iter(&self) -> impl Iterator<Item = (Table, &BTreeSet<&'static str>)> {
        self.tables.iter().map(|(t, c)| (*t, c))
    }

    /// Declares every subscription to the store.
    pub fn register(&self, store: &dyn StoreClient) {
        for (table, columns) in self.iter() {
            let columns: Vec<&str> = columns.iter().copied().collect();
            store.subscribe(table, &columns);
        }
    }
}

/// Classifies row changes since a sequence number.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    subscriptions: Subscriptions,
}

impl ChangeDetector {
    /// Creates a detector for the given subscriptions.
    pub fn new(subscriptions: Subscriptions) -> Self {
        Self { subscriptions }
    }

    /// The detector's subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Classifies every subscribed row of `snapshot` relative to
    /// `last_seq` and returns the snapshot's sequence number with the
    /// changes.
    ///
    /// Returns `(last_seq, empty)` without looking at any row when the
    /// snapshot is at `last_seq`. Rows inserted and deleted within the
    /// window yield nothing. A modification that only touches
    /// unsubscribed columns yields nothing.
    #[must_use]
    pub fn detect(
        &self,
        snapshot: &Snapshot,
        last_seq: SequenceNumber,
    ) -> (SequenceNumber, ChangeSet) {
        if snapshot.seq() == last_seq {
            return (last_seq, ChangeSet::empty(last_seq));
        }

        let mut records = Vec::new();
        for (table, columns) in self.subscriptions.iter() {
            for tombstone in snapshot.tombstones(table) {
                if tombstone.deleted_since(last_seq) && !tombstone.transient_since(last_seq) {
                    records.push(ChangeRecord {
                        table,
                        row_id: tombstone.row.id(),
                        kind: ChangeKind::Deleted,
                        changed_columns: BTreeSet::new(),
                        row: Arc::clone(&tombstone.row),
                    });
                }
            }

            for row in snapshot.rows(table) {
                if row.inserted_since(last_seq) {
                    records.push(ChangeRecord {
                        table,
                        row_id: row.id(),
                        kind: ChangeKind::Inserted,
                        changed_columns: row.columns().keys().cloned().collect(),
                        row: Arc::clone(row),
                    });
                } else if row.modified_since(last_seq) {
                    let changed: BTreeSet<String> = row
                        .changed_columns_since(last_seq)
                        .into_iter()
                        .filter(|c| columns.contains(c.as_str()))
                        .collect();
                    if !changed.is_empty() {
                        records.push(ChangeRecord {
                            table,
                            row_id: row.id(),
                            kind: ChangeKind::Modified,
                            changed_columns: changed,
                            row: Arc::clone(row),
                        });
                    }
                }
            }
        }

        let seq = snapshot.seq();
        (
            seq,
            ChangeSet {
                from: last_seq,
                to: seq,
                records,
            },
        )
    }
}
