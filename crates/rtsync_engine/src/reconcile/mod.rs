//! Reconcilers: configuration changes to protocol runtime calls.
//!
//! Every reconciler applies one pass in the same fixed order:
//!
//! 1. Deletions, children before parents. A parent that still has live
//!    children is deferred; the deferred set is re-evaluated at the start
//!    and at the end of the deletion phase, and once more at the end of
//!    the pass since modifications can move children away.
//! 2. Insertions, parents before children. Inserted rows are initialized
//!    from their full value, and so are unsynced rows (see below).
//! 3. Modifications of bound rows, driven by the changed column set.
//!
//! A row that fails (malformed input, runtime rejection) is recorded as a
//! [`RowFailure`] and the pass carries on with the next row.
//!
//! A live row whose instance is missing or stale, because its insertion
//! or a later modification failed or because its parent was torn down, is
//! kept in an [`Unsynced`] set. Every pass initializes those rows again
//! from their current value until one attempt succeeds. A failing retry is
//! reported only when the row itself changed in that pass.

mod bgp;
mod ospf;
mod rib;

pub use bgp::BgpReconciler;
pub use ospf::OspfReconciler;
pub use rib::RibReconciler;

use crate::change::ChangeSet;
use crate::error::EngineError;
use crate::index::SnapshotIndex;
use crate::runtime::ProtocolRuntime;
use rtsync_store::{Row, RowId, Snapshot, Table};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol domain of a reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// BGP routers and neighbors.
    Bgp,
    /// OSPF routers, areas and interfaces.
    Ospf,
    /// Static routes.
    Rib,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Bgp => "bgp",
            Domain::Ospf => "ospf",
            Domain::Rib => "rib",
        })
    }
}

/// Everything a reconciler reads during one pass.
#[derive(Debug, Clone, Copy)]
pub struct PassInput<'a> {
    /// The snapshot being reconciled.
    pub snapshot: &'a Snapshot,
    /// Key lookups over `snapshot`.
    pub index: &'a SnapshotIndex,
    /// Changes since the last processed snapshot.
    pub changes: &'a ChangeSet,
}

/// A row whose change could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// Table of the row.
    pub table: Table,
    /// The row.
    #[serde(serialize_with = "serialize_display")]
    pub row_id: RowId,
    /// What went wrong.
    pub error: String,
}

fn serialize_display<S: serde::Serializer>(id: &RowId, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(id)
}

/// Outcome of one reconciler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    /// Instances created.
    pub created: usize,
    /// Instances whose fields were updated.
    pub updated: usize,
    /// Instances destroyed.
    pub destroyed: usize,
    /// Parents whose teardown was deferred this pass.
    pub deferred: usize,
    /// Changes ignored because the instance was not found.
    pub skipped: usize,
    /// Rows that failed.
    pub failures: Vec<RowFailure>,
}

impl ReconcileResult {
    /// True if the pass changed the runtime.
    #[must_use]
    pub fn changed_runtime(&self) -> bool {
        self.created + self.updated + self.destroyed > 0
    }

    /// Adds another result's counts to this one.
    pub fn merge(&mut self, other: ReconcileResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.destroyed += other.destroyed;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    pub(crate) fn fail(&mut self, table: Table, row_id: RowId, error: EngineError) {
        warn!(%table, row = %row_id, error = %error, "row failed");
        self.failures.push(RowFailure {
            table,
            row_id,
            error: error.to_string(),
        });
    }

    /// Records a failed initialization. Retries of rows that did not
    /// change this pass were already reported and only get logged.
    pub(crate) fn fail_attempt(&mut self, attempt: &Attempt, error: EngineError) {
        if attempt.changed {
            self.fail(attempt.row.table(), attempt.row.id(), error);
        } else {
            debug!(
                table = %attempt.row.table(),
                row = %attempt.row.id(),
                error = %error,
                "unsynced row still failing"
            );
        }
    }
}

/// A row to initialize from its full current value.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    /// The live row.
    pub row: Arc<Row>,
    /// Whether the row has a change record this pass.
    pub changed: bool,
}

/// Live rows of one table whose instance is missing or stale.
#[derive(Debug)]
pub(crate) struct Unsynced {
    table: Table,
    rows: BTreeSet<RowId>,
}

impl Unsynced {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            rows: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: RowId) {
        self.rows.insert(id);
    }

    pub(crate) fn remove(&mut self, id: RowId) {
        self.rows.remove(&id);
    }

    pub(crate) fn contains(&self, id: RowId) -> bool {
        self.rows.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Replaces the set with every live row of the table.
    pub(crate) fn reset_to_live(&mut self, snapshot: &Snapshot) {
        self.rows = snapshot.rows(self.table).map(|row| row.id()).collect();
    }

    /// Rows to initialize this pass, in order: inserted rows, modified
    /// rows that are unbound or held here, then held rows that did not
    /// change. Held rows that are no longer live are dropped.
    pub(crate) fn attempts(
        &mut self,
        input: &PassInput<'_>,
        is_bound: impl Fn(RowId) -> bool,
    ) -> Vec<Attempt> {
        let table = self.table;
        let mut seen = HashSet::new();
        let mut attempts = Vec::new();
        for rec in input.changes.inserted(table) {
            if seen.insert(rec.row_id) {
                attempts.push(Attempt {
                    row: Arc::clone(&rec.row),
                    changed: true,
                });
            }
        }
        for rec in input.changes.modified(table) {
            if (!is_bound(rec.row_id) || self.rows.contains(&rec.row_id)) && seen.insert(rec.row_id)
            {
                attempts.push(Attempt {
                    row: Arc::clone(&rec.row),
                    changed: true,
                });
            }
        }
        self.rows.retain(|id| input.snapshot.get(table, *id).is_some());
        for id in &self.rows {
            if seen.insert(*id) {
                if let Some(row) = input.snapshot.get(table, *id) {
                    attempts.push(Attempt {
                        row: Arc::clone(row),
                        changed: false,
                    });
                }
            }
        }
        attempts
    }
}

/// Applies configuration changes of one domain to the protocol runtime.
pub trait Reconciler: Send {
    /// The domain this reconciler owns.
    fn domain(&self) -> Domain;

    /// Applies one pass of changes.
    fn apply(&mut self, input: &PassInput<'_>, runtime: &mut dyn ProtocolRuntime)
        -> ReconcileResult;

    /// Number of parent instances whose teardown is deferred.
    fn pending_teardown(&self) -> usize;

    /// Number of live rows waiting to be initialized again.
    fn unsynced_rows(&self) -> usize;
}

/// Error for a modified row whose key columns now name another instance.
pub(crate) fn key_changed(
    table: Table,
    column: &str,
    old: impl fmt::Display,
    new: impl fmt::Display,
) -> EngineError {
    EngineError::malformed(
        table,
        column,
        format!("key column changed from {old} to {new}; delete and re-create the row"),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::change::{ChangeDetector, Subscriptions};
    use crate::config::Domains;
    use rtsync_store::{CommitStatus, MemoryStore, SequenceNumber, StoreClient, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Store plus detector state for driving a single reconciler.
    pub struct Driver {
        pub store: MemoryStore,
        detector: ChangeDetector,
        last_seq: SequenceNumber,
    }

    impl Driver {
        pub fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                detector: ChangeDetector::new(Subscriptions::for_domains(Domains::default())),
                last_seq: SequenceNumber::ZERO,
            }
        }

        pub fn insert(&self, table: Table, pairs: &[(&str, Value)]) -> RowId {
            let mut txn = self.store.begin().unwrap();
            let id = txn.insert(table, cols(pairs)).unwrap();
            assert_eq!(self.store.commit(txn), CommitStatus::Success);
            id
        }

        pub fn update(&self, table: Table, id: RowId, pairs: &[(&str, Value)]) {
            let row = Arc::clone(self.store.snapshot().get(table, id).unwrap());
            let mut txn = self.store.begin().unwrap();
            for (k, v) in pairs {
                txn.update(&row, k, v.clone()).unwrap();
            }
            assert_eq!(self.store.commit(txn), CommitStatus::Success);
        }

        pub fn delete(&self, table: Table, id: RowId) {
            let row = Arc::clone(self.store.snapshot().get(table, id).unwrap());
            let mut txn = self.store.begin().unwrap();
            txn.delete(&row).unwrap();
            assert_eq!(self.store.commit(txn), CommitStatus::Success);
        }

        pub fn pass(
            &mut self,
            reconciler: &mut dyn Reconciler,
            runtime: &mut dyn ProtocolRuntime,
        ) -> ReconcileResult {
            let snapshot = self.store.snapshot();
            let index = SnapshotIndex::build(&snapshot);
            let (seq, changes) = self.detector.detect(&snapshot, self.last_seq);
            self.last_seq = seq;
            reconciler.apply(
                &PassInput {
                    snapshot: &snapshot,
                    index: &index,
                    changes: &changes,
                },
                runtime,
            )
        }
    }

    pub fn cols(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    pub fn calls(ops: &[crate::runtime::RuntimeOp]) -> Vec<&'static str> {
        ops.iter().map(|op| op.call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates() {
        let mut a = ReconcileResult {
            created: 1,
            ..ReconcileResult::default()
        };
        let mut b = ReconcileResult {
            destroyed: 2,
            ..ReconcileResult::default()
        };
        b.fail(Table::Route, RowId::new(), EngineError::missing(Table::Route, "x"));
        a.merge(b);
        assert_eq!(a.created, 1);
        assert_eq!(a.destroyed, 2);
        assert_eq!(a.failures.len(), 1);
        assert!(a.changed_runtime());
    }

    #[test]
    fn domain_names() {
        assert_eq!(Domain::Ospf.to_string(), "ospf");
        assert_eq!(serde_json::to_value(Domain::Rib).unwrap(), "rib");
    }
}
