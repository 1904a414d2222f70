//! Test fixtures: an engine wired to an in-memory store and runtime.
//!
//! [`Harness`] plays the configuration manager (writing rows straight into
//! the store) and the event loop (running passes on demand).

use rtsync_engine::runtime::MemoryRuntime;
use rtsync_engine::{EngineConfig, PassOutcome, ReconcilerContext};
use rtsync_store::columns::system;
use rtsync_store::{MemoryStore, Row, RowId, Snapshot, StoreClient, Table, Transaction, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Column/value pairs of one row.
pub type Columns = Vec<(&'static str, Value)>;

/// An engine, its store and its runtime.
pub struct Harness {
    /// The shared store.
    pub store: Arc<MemoryStore>,
    /// The engine under test.
    pub engine: ReconcilerContext<MemoryRuntime>,
}

impl Harness {
    /// Creates a harness whose system row is already configured.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a configured harness with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        write_columns(&store, Table::System, &[(system::CUR_CFG, Value::from(1i64))]);
        Self::from_store(store, config)
    }

    /// Creates a harness with no system row.
    pub fn unconfigured() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    /// Creates a harness over an existing store.
    pub fn from_store(store: Arc<MemoryStore>, config: EngineConfig) -> Self {
        let engine = ReconcilerContext::new(
            config,
            Arc::clone(&store) as Arc<dyn StoreClient>,
            MemoryRuntime::new(),
        );
        Self { store, engine }
    }

    /// Inserts one row and commits.
    pub fn insert(&self, table: Table, columns: &[(&str, Value)]) -> RowId {
        write_columns(&self.store, table, columns)
    }

    /// Replaces columns of an existing row and commits.
    pub fn update(&self, table: Table, id: RowId, columns: &[(&str, Value)]) {
        let row = self.row(table, id).expect("row to update");
        self.transact(|txn| {
            for (column, value) in columns {
                txn.update(&row, column, value.clone()).expect("update");
            }
        });
    }

    /// Deletes rows in one transaction.
    pub fn delete(&self, rows: &[(Table, RowId)]) {
        let snapshot = self.snapshot();
        self.transact(|txn| {
            for (table, id) in rows {
                let row = snapshot.get(*table, *id).expect("row to delete");
                txn.delete(row).expect("delete");
            }
        });
    }

    /// Runs `f` inside one transaction and commits it.
    pub fn transact(&self, f: impl FnOnce(&mut Transaction)) {
        transact(&self.store, f);
    }

    /// Runs one reconciliation pass.
    pub fn pass(&mut self) -> PassOutcome {
        self.engine.run_pass()
    }

    /// The engine's runtime.
    pub fn runtime(&self) -> &MemoryRuntime {
        self.engine.runtime()
    }

    /// The engine's runtime, mutably.
    pub fn runtime_mut(&mut self) -> &mut MemoryRuntime {
        self.engine.runtime_mut()
    }

    /// The current store snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    /// A live row, if present.
    pub fn row(&self, table: Table, id: RowId) -> Option<Arc<Row>> {
        self.snapshot().get(table, id).cloned()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` inside one transaction on `store` and commits it.
///
/// # Panics
///
/// Panics if the store refuses the transaction.
pub fn transact(store: &MemoryStore, f: impl FnOnce(&mut Transaction)) {
    let mut txn = store.begin().expect("begin");
    f(&mut txn);
    let status = store.commit(txn);
    assert!(status.is_done(), "fixture commit returned {status:?}");
}

/// Inserts one row into `store` and returns its ID.
pub fn write_columns(store: &MemoryStore, table: Table, columns: &[(&str, Value)]) -> RowId {
    let mut id = None;
    transact(store, |txn| {
        id = Some(txn.insert(table, to_map(columns)).expect("insert"));
    });
    id.expect("inserted row")
}

fn to_map(columns: &[(&str, Value)]) -> BTreeMap<String, Value> {
    columns
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Column sets for common configuration rows.
pub mod rows {
    use super::Columns;
    use rtsync_store::columns::{
        bgp_neighbor, bgp_router, ospf_area, ospf_interface, ospf_router, route,
    };
    use rtsync_store::{RowId, Value};

    /// A BGP router.
    pub fn bgp_router(asn: u32) -> Columns {
        vec![(bgp_router::ASN, Value::from(asn))]
    }

    /// A BGP neighbor of `router`.
    pub fn bgp_neighbor(router: RowId, address: &str, remote_as: u32) -> Columns {
        vec![
            (bgp_neighbor::BGP_ROUTER, Value::Ref(router)),
            (bgp_neighbor::IP_ADDRESS, Value::text(address)),
            (bgp_neighbor::REMOTE_AS, Value::from(remote_as)),
        ]
    }

    /// An OSPF area.
    pub fn ospf_area(area_id: &str) -> Columns {
        vec![(ospf_area::AREA_ID, Value::text(area_id))]
    }

    /// An OSPF router with its area map.
    pub fn ospf_router(tag: &str, areas: &[(&str, RowId)]) -> Columns {
        vec![
            (ospf_router::INSTANCE_TAG, Value::text(tag)),
            (
                ospf_router::AREAS,
                Value::map(areas.iter().map(|(id, row)| (*id, Value::Ref(*row)))),
            ),
        ]
    }

    /// An OSPF interface attached to `area_id` of instance `tag`.
    pub fn ospf_interface(name: &str, tag: &str, area_id: &str) -> Columns {
        vec![
            (ospf_interface::NAME, Value::text(name)),
            (ospf_interface::INSTANCE_TAG, Value::text(tag)),
            (ospf_interface::AREA_ID, Value::text(area_id)),
        ]
    }

    /// A static route through `nexthop`.
    pub fn static_route(prefix: &str, nexthop: &str) -> Columns {
        vec![
            (route::PREFIX, Value::text(prefix)),
            (route::FROM, Value::text(route::FROM_STATIC)),
            (route::NEXTHOPS, Value::text_list([nexthop])),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsync_engine::runtime::BgpRuntime;

    #[test]
    fn harness_reconciles_inserted_rows() {
        let mut h = Harness::new();
        let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
        h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.2", 65002));

        assert!(matches!(h.pass(), PassOutcome::Applied(_)));
        assert_eq!(h.runtime().bgp_routers(), vec![65001]);
        assert_eq!(h.runtime().instance_count(), 2);
    }

    #[test]
    fn delete_removes_rows_together() {
        let h = Harness::new();
        let a = h.insert(Table::BgpRouter, &rows::bgp_router(1));
        let b = h.insert(Table::BgpRouter, &rows::bgp_router(2));
        let before = h.snapshot().seq();

        h.delete(&[(Table::BgpRouter, a), (Table::BgpRouter, b)]);
        assert_eq!(h.snapshot().seq(), before.next());
        assert!(h.row(Table::BgpRouter, a).is_none());
    }
}
