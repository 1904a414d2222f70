//! BGP reconciler: `BGP_Router` and `BGP_Neighbor` rows.

use super::{key_changed, Attempt, Domain, PassInput, ReconcileResult, Reconciler, Unsynced};
use crate::change::ChangeRecord;
use crate::error::{EngineError, EngineResult};
use crate::fields;
use crate::prefix::Prefix;
use crate::runtime::{ProtocolRuntime, RuntimeError};
use rtsync_store::columns::{bgp_neighbor, bgp_router};
use rtsync_store::{Row, RowId, Snapshot, Table};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

const DEFAULT_MAXIMUM_PATHS: u32 = 1;

/// Declared state of a router row.
struct RouterSpec {
    asn: u32,
    router_id: Option<Ipv4Addr>,
    networks: BTreeSet<Prefix>,
    redistribute: BTreeSet<String>,
    maximum_paths: Option<u32>,
}

impl RouterSpec {
    fn parse(row: &Row) -> EngineResult<Self> {
        Ok(Self {
            asn: fields::u32_value(row, bgp_router::ASN)?,
            router_id: fields::optional_ipv4(row, bgp_router::ROUTER_ID)?,
            networks: fields::prefix_set(row, bgp_router::NETWORKS)?,
            redistribute: fields::text_set(row, bgp_router::REDISTRIBUTE)?,
            maximum_paths: fields::optional_u32(row, bgp_router::MAXIMUM_PATHS)?,
        })
    }
}

/// Declared state of a neighbor row.
struct NeighborSpec {
    address: IpAddr,
    remote_as: u32,
    description: Option<String>,
    shutdown: bool,
}

impl NeighborSpec {
    fn parse(row: &Row) -> EngineResult<Self> {
        Ok(Self {
            address: fields::ip(row, bgp_neighbor::IP_ADDRESS)?,
            remote_as: fields::u32_value(row, bgp_neighbor::REMOTE_AS)?,
            description: fields::optional_text(row, bgp_neighbor::DESCRIPTION)?
                .map(str::to_string),
            shutdown: fields::optional_bool(row, bgp_neighbor::SHUTDOWN)?.unwrap_or(false),
        })
    }
}

/// Keeps BGP routers and neighbors in line with their rows.
#[derive(Debug)]
pub struct BgpReconciler {
    routers: HashMap<RowId, u32>,
    neighbors: HashMap<RowId, (u32, IpAddr)>,
    deferred: BTreeSet<u32>,
    unsynced_routers: Unsynced,
    unsynced_neighbors: Unsynced,
}

impl Default for BgpReconciler {
    fn default() -> Self {
        Self {
            routers: HashMap::new(),
            neighbors: HashMap::new(),
            deferred: BTreeSet::new(),
            unsynced_routers: Unsynced::new(Table::BgpRouter),
            unsynced_neighbors: Unsynced::new(Table::BgpNeighbor),
        }
    }
}

impl BgpReconciler {
    /// Creates a reconciler with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn teardown_all(
        &mut self,
        snapshot: &Snapshot,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) {
        let asns = runtime.bgp_routers();
        for asn in &asns {
            let addresses: Vec<IpAddr> = runtime
                .bgp_router(*asn)
                .map(|r| r.neighbors.keys().copied().collect())
                .unwrap_or_default();
            for address in addresses {
                match runtime.destroy_bgp_neighbor(*asn, address) {
                    Ok(()) => result.destroyed += 1,
                    Err(e) => warn!(asn, %address, error = %e, "neighbor teardown failed"),
                }
            }
            match runtime.destroy_bgp_router(*asn) {
                Ok(()) => result.destroyed += 1,
                Err(e) => warn!(asn, error = %e, "router teardown failed"),
            }
        }
        if !asns.is_empty() {
            info!(routers = asns.len(), "BGP router table empty, tore down all instances");
        }
        self.routers.clear();
        self.neighbors.clear();
        self.deferred.clear();
        // Surviving neighbors come back with their router.
        self.unsynced_routers.reset_to_live(snapshot);
        self.unsynced_neighbors.reset_to_live(snapshot);
    }

    fn retry_deferred(
        &mut self,
        input: &PassInput<'_>,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) {
        let pending: Vec<u32> = self.deferred.iter().copied().collect();
        for asn in pending {
            let redeclared = input.index.bgp_router(asn).is_some_and(|row| {
                row.inserted_since(input.changes.from_seq())
                    || self.routers.get(&row.id()) == Some(&asn)
            });
            if redeclared {
                debug!(asn, "deferred router declared again");
                self.deferred.remove(&asn);
                continue;
            }
            let neighbors = match runtime.bgp_router(asn) {
                Some(router) => router.neighbors.len(),
                None => {
                    self.deferred.remove(&asn);
                    continue;
                }
            };
            if neighbors == 0 {
                match runtime.destroy_bgp_router(asn) {
                    Ok(()) => {
                        info!(asn, "destroyed deferred router");
                        result.destroyed += 1;
                        self.deferred.remove(&asn);
                    }
                    Err(e) => warn!(asn, error = %e, "deferred router teardown failed"),
                }
            }
        }
    }

    fn delete_neighbor(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let (asn, address) = match self.neighbors.remove(&rec.row_id) {
            Some(key) => key,
            None => {
                debug!(row = %rec.row_id, "deleted neighbor was never bound");
                result.skipped += 1;
                return Ok(());
            }
        };
        let live = runtime
            .bgp_router(asn)
            .is_some_and(|r| r.neighbors.contains_key(&address));
        if !live {
            debug!(asn, %address, "deleted neighbor not found");
            result.skipped += 1;
            return Ok(());
        }
        runtime.destroy_bgp_neighbor(asn, address)?;
        debug!(asn, %address, "destroyed neighbor");
        result.destroyed += 1;
        Ok(())
    }

    fn delete_router(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(asn) = self.routers.remove(&rec.row_id) else {
            debug!(row = %rec.row_id, "deleted router was never bound");
            result.skipped += 1;
            return Ok(());
        };
        match runtime.bgp_router(asn).map(|r| r.neighbors.len()) {
            None => {
                debug!(asn, "deleted router not found");
                result.skipped += 1;
            }
            Some(0) => {
                runtime.destroy_bgp_router(asn)?;
                debug!(asn, "destroyed router");
                result.destroyed += 1;
            }
            Some(neighbors) => {
                info!(asn, neighbors, "router teardown deferred");
                self.deferred.insert(asn);
                result.deferred += 1;
            }
        }
        Ok(())
    }

    fn insert_router(
        &mut self,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let spec = RouterSpec::parse(row)?;
        if let Some(&bound) = self.routers.get(&row.id()) {
            if bound != spec.asn {
                return Err(key_changed(Table::BgpRouter, bgp_router::ASN, bound, spec.asn));
            }
        }
        let fresh = runtime.bgp_router(spec.asn).is_none();
        if fresh {
            runtime.create_bgp_router(spec.asn)?;
        } else {
            let taken = self
                .routers
                .iter()
                .any(|(id, asn)| *asn == spec.asn && *id != row.id());
            if taken {
                return Err(RuntimeError::already_exists("bgp router", spec.asn).into());
            }
            self.deferred.remove(&spec.asn);
        }
        self.routers.insert(row.id(), spec.asn);
        init_router(runtime, &spec, fresh)?;
        if fresh {
            debug!(asn = spec.asn, "created router");
            result.created += 1;
        } else {
            debug!(asn = spec.asn, "re-initialized router");
            result.updated += 1;
        }
        Ok(())
    }

    fn insert_neighbor(
        &mut self,
        input: &PassInput<'_>,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let asn = neighbor_router(input, row)?;
        let spec = NeighborSpec::parse(row)?;
        if let Some(&(bound_asn, bound_address)) = self.neighbors.get(&row.id()) {
            if (bound_asn, bound_address) != (asn, spec.address) {
                return Err(key_changed(
                    Table::BgpNeighbor,
                    bgp_neighbor::IP_ADDRESS,
                    format!("{bound_asn}/{bound_address}"),
                    format!("{asn}/{}", spec.address),
                ));
            }
            let live = runtime
                .bgp_router(asn)
                .is_some_and(|r| r.neighbors.contains_key(&spec.address));
            if live {
                runtime.set_bgp_neighbor_remote_as(asn, spec.address, spec.remote_as)?;
                runtime.set_bgp_neighbor_description(asn, spec.address, spec.description)?;
                runtime.set_bgp_neighbor_shutdown(asn, spec.address, spec.shutdown)?;
                debug!(asn, address = %spec.address, "re-initialized neighbor");
                result.updated += 1;
                return Ok(());
            }
        }
        runtime.create_bgp_neighbor(asn, spec.address, spec.remote_as)?;
        self.neighbors.insert(row.id(), (asn, spec.address));
        if spec.description.is_some() {
            runtime.set_bgp_neighbor_description(asn, spec.address, spec.description)?;
        }
        if spec.shutdown {
            runtime.set_bgp_neighbor_shutdown(asn, spec.address, true)?;
        }
        debug!(asn, address = %spec.address, remote_as = spec.remote_as, "created neighbor");
        result.created += 1;
        Ok(())
    }

    fn modify_router(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(&asn) = self.routers.get(&rec.row_id) else {
            debug!(row = %rec.row_id, "modification for unbound router");
            result.skipped += 1;
            return Ok(());
        };
        let spec = RouterSpec::parse(&rec.row)?;
        if spec.asn != asn {
            return Err(key_changed(Table::BgpRouter, bgp_router::ASN, asn, spec.asn));
        }
        if runtime.bgp_router(asn).is_none() {
            debug!(asn, "modification for missing router");
            result.skipped += 1;
            return Ok(());
        }

        let mut touched = false;
        if rec.changed(bgp_router::ROUTER_ID) {
            runtime.set_bgp_router_id(asn, spec.router_id)?;
            touched = true;
        }
        if rec.changed(bgp_router::NETWORKS) {
            touched |= sync_networks(runtime, asn, &spec.networks)?;
        }
        if rec.changed(bgp_router::REDISTRIBUTE) {
            runtime.set_bgp_redistribute(asn, spec.redistribute)?;
            touched = true;
        }
        if rec.changed(bgp_router::MAXIMUM_PATHS) {
            let paths = spec.maximum_paths.unwrap_or(DEFAULT_MAXIMUM_PATHS);
            runtime.set_bgp_maximum_paths(asn, paths)?;
            touched = true;
        }
        if touched {
            debug!(asn, columns = ?rec.changed_columns, "updated router");
            result.updated += 1;
        }
        Ok(())
    }

    fn modify_neighbor(
        &mut self,
        input: &PassInput<'_>,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(&(asn, address)) = self.neighbors.get(&rec.row_id) else {
            debug!(row = %rec.row_id, "modification for unbound neighbor");
            result.skipped += 1;
            return Ok(());
        };
        let spec = NeighborSpec::parse(&rec.row)?;
        if rec.changed(bgp_neighbor::BGP_ROUTER) || rec.changed(bgp_neighbor::IP_ADDRESS) {
            let new_asn = neighbor_router(input, &rec.row)?;
            if (new_asn, spec.address) != (asn, address) {
                return Err(key_changed(
                    Table::BgpNeighbor,
                    bgp_neighbor::IP_ADDRESS,
                    format!("{asn}/{address}"),
                    format!("{new_asn}/{}", spec.address),
                ));
            }
        }
        let live = runtime
            .bgp_router(asn)
            .is_some_and(|r| r.neighbors.contains_key(&address));
        if !live {
            debug!(asn, %address, "modification for missing neighbor");
            result.skipped += 1;
            return Ok(());
        }

        let mut touched = false;
        if rec.changed(bgp_neighbor::REMOTE_AS) {
            runtime.set_bgp_neighbor_remote_as(asn, address, spec.remote_as)?;
            touched = true;
        }
        if rec.changed(bgp_neighbor::DESCRIPTION) {
            runtime.set_bgp_neighbor_description(asn, address, spec.description)?;
            touched = true;
        }
        if rec.changed(bgp_neighbor::SHUTDOWN) {
            runtime.set_bgp_neighbor_shutdown(asn, address, spec.shutdown)?;
            touched = true;
        }
        if touched {
            debug!(asn, %address, columns = ?rec.changed_columns, "updated neighbor");
            result.updated += 1;
        }
        Ok(())
    }
}

impl Reconciler for BgpReconciler {
    fn domain(&self) -> Domain {
        Domain::Bgp
    }

    fn apply(
        &mut self,
        input: &PassInput<'_>,
        runtime: &mut dyn ProtocolRuntime,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        if input.snapshot.is_empty(Table::BgpRouter) {
            self.teardown_all(input.snapshot, runtime, &mut result);
            return result;
        }
        let changes = input.changes;

        self.retry_deferred(input, runtime, &mut result);
        for rec in changes.deleted(Table::BgpNeighbor) {
            self.unsynced_neighbors.remove(rec.row_id);
            if let Err(e) = self.delete_neighbor(rec, runtime, &mut result) {
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.deleted(Table::BgpRouter) {
            self.unsynced_routers.remove(rec.row_id);
            if let Err(e) = self.delete_router(rec, runtime, &mut result) {
                result.fail(rec.table, rec.row_id, e);
            }
        }
        self.retry_deferred(input, runtime, &mut result);

        let routers = self
            .unsynced_routers
            .attempts(input, |id| self.routers.contains_key(&id));
        for attempt in &routers {
            match self.insert_router(&attempt.row, runtime, &mut result) {
                Ok(()) => self.unsynced_routers.remove(attempt.row.id()),
                Err(e) => {
                    self.unsynced_routers.insert(attempt.row.id());
                    result.fail_attempt(attempt, e);
                }
            }
        }
        let neighbors = self
            .unsynced_neighbors
            .attempts(input, |id| self.neighbors.contains_key(&id));
        for attempt in &neighbors {
            match self.insert_neighbor(input, &attempt.row, runtime, &mut result) {
                Ok(()) => self.unsynced_neighbors.remove(attempt.row.id()),
                Err(e) => {
                    self.unsynced_neighbors.insert(attempt.row.id());
                    result.fail_attempt(attempt, e);
                }
            }
        }

        let initialized: HashSet<RowId> = routers
            .iter()
            .chain(&neighbors)
            .map(|a: &Attempt| a.row.id())
            .collect();
        for rec in changes.modified(Table::BgpRouter) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify_router(rec, runtime, &mut result) {
                self.unsynced_routers.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.modified(Table::BgpNeighbor) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify_neighbor(input, rec, runtime, &mut result) {
                self.unsynced_neighbors.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        self.retry_deferred(input, runtime, &mut result);
        result
    }

    fn pending_teardown(&self) -> usize {
        self.deferred.len()
    }

    fn unsynced_rows(&self) -> usize {
        self.unsynced_routers.len() + self.unsynced_neighbors.len()
    }
}

/// ASN of the router a neighbor row references. The router row may be
/// live or already deleted.
fn neighbor_router(input: &PassInput<'_>, row: &Row) -> EngineResult<u32> {
    let router = fields::reference(row, bgp_neighbor::BGP_ROUTER)?;
    if let Some(asn) = input.index.bgp_router_asn(router) {
        return Ok(asn);
    }
    match input.snapshot.resolve(Table::BgpRouter, router) {
        Some(row) => fields::u32_value(row, bgp_router::ASN),
        None => Err(EngineError::missing(Table::BgpRouter, router)),
    }
}

/// Applies a router's full declared state. A fresh router only gets the
/// setters for declared values; an existing one is reset completely.
fn init_router(
    runtime: &mut dyn ProtocolRuntime,
    spec: &RouterSpec,
    fresh: bool,
) -> EngineResult<()> {
    let asn = spec.asn;
    if !fresh || spec.router_id.is_some() {
        runtime.set_bgp_router_id(asn, spec.router_id)?;
    }
    sync_networks(runtime, asn, &spec.networks)?;
    if !fresh || !spec.redistribute.is_empty() {
        runtime.set_bgp_redistribute(asn, spec.redistribute.clone())?;
    }
    match spec.maximum_paths {
        Some(paths) => runtime.set_bgp_maximum_paths(asn, paths)?,
        None if !fresh => runtime.set_bgp_maximum_paths(asn, DEFAULT_MAXIMUM_PATHS)?,
        None => {}
    }
    Ok(())
}

/// Adds and removes networks so the live set equals `desired`. Returns
/// whether anything changed.
fn sync_networks(
    runtime: &mut dyn ProtocolRuntime,
    asn: u32,
    desired: &BTreeSet<Prefix>,
) -> EngineResult<bool> {
    let live = runtime
        .bgp_router(asn)
        .map(|r| r.networks.clone())
        .unwrap_or_default();
    let mut changed = false;
    for stale in live.difference(desired) {
        runtime.remove_bgp_network(asn, *stale)?;
        changed = true;
    }
    for fresh in desired.difference(&live) {
        runtime.add_bgp_network(asn, *fresh)?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{calls, Driver};
    use super::*;
    use crate::runtime::{BgpRuntime, MemoryRuntime};
    use rtsync_store::{StoreClient, Value};
    use std::sync::Arc;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn inserts_router_then_neighbor() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();

        let router = d.insert(
            Table::BgpRouter,
            &[
                ("asn", Value::from(65001i64)),
                ("router_id", Value::text("1.1.1.1")),
                ("networks", Value::text_list(["10.0.0.0/8"])),
            ],
        );
        d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(65002i64)),
            ],
        );

        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.created, 2);
        assert!(result.failures.is_empty());
        assert_eq!(
            calls(rt.ops()),
            vec![
                "create_bgp_router",
                "set_bgp_router_id",
                "add_bgp_network",
                "create_bgp_neighbor"
            ]
        );
        let state = rt.bgp_router(65001).unwrap();
        assert_eq!(state.router_id, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(state.neighbors[&addr("10.0.0.2")].remote_as, 65002);
    }

    #[test]
    fn router_id_change_calls_only_its_setter() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(
            Table::BgpRouter,
            &[
                ("asn", Value::from(65001i64)),
                ("networks", Value::text_list(["10.0.0.0/8"])),
            ],
        );
        d.pass(&mut rec, &mut rt);
        rt.take_ops();

        d.update(Table::BgpRouter, router, &[("router_id", Value::text("2.2.2.2"))]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.updated, 1);
        assert_eq!(calls(rt.ops()), vec!["set_bgp_router_id"]);
    }

    #[test]
    fn networks_are_diffed() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(
            Table::BgpRouter,
            &[
                ("asn", Value::from(1i64)),
                ("networks", Value::text_list(["10.0.0.0/8", "172.16.0.0/12"])),
            ],
        );
        d.pass(&mut rec, &mut rt);
        rt.take_ops();

        d.update(
            Table::BgpRouter,
            router,
            &[("networks", Value::text_list(["10.0.0.0/8", "192.168.0.0/16"]))],
        );
        d.pass(&mut rec, &mut rt);
        let ops: Vec<String> = rt.ops().iter().map(ToString::to_string).collect();
        assert_eq!(
            ops,
            vec![
                "remove_bgp_network(1/172.16.0.0/12)",
                "add_bgp_network(1/192.168.0.0/16)"
            ]
        );
    }

    #[test]
    fn cleared_maximum_paths_falls_back_to_default() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(
            Table::BgpRouter,
            &[("asn", Value::from(1i64)), ("maximum_paths", Value::from(4i64))],
        );
        d.pass(&mut rec, &mut rt);
        assert_eq!(rt.bgp_router(1).unwrap().maximum_paths, 4);

        d.update(Table::BgpRouter, router, &[("maximum_paths", Value::Null)]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.updated, 1);
        assert_eq!(rt.bgp_router(1).unwrap().maximum_paths, DEFAULT_MAXIMUM_PATHS);
    }

    #[test]
    fn router_deletion_waits_for_neighbors() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        d.insert(Table::BgpRouter, &[("asn", Value::from(2i64))]);
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(1i64))]);
        let neighbor = d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(3i64)),
            ],
        );
        d.pass(&mut rec, &mut rt);

        d.delete(Table::BgpRouter, router);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.deferred, 1);
        assert!(rt.bgp_router(1).is_some());
        assert_eq!(rec.pending_teardown(), 1);

        d.delete(Table::BgpNeighbor, neighbor);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.destroyed, 2);
        assert!(rt.bgp_router(1).is_none());
        assert!(rt.bgp_router(2).is_some());
        assert_eq!(rec.pending_teardown(), 0);
    }

    #[test]
    fn empty_router_table_tears_everything_down() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(65001i64))]);
        d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(65002i64)),
            ],
        );
        d.pass(&mut rec, &mut rt);
        rt.take_ops();

        d.store.truncate_table(Table::BgpRouter);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.destroyed, 2);
        assert_eq!(
            calls(rt.ops()),
            vec!["destroy_bgp_neighbor", "destroy_bgp_router"]
        );
        assert_eq!(rt.instance_count(), 0);
    }

    #[test]
    fn malformed_row_is_isolated() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let bad = d.insert(
            Table::BgpRouter,
            &[
                ("asn", Value::from(1i64)),
                ("networks", Value::text_list(["10.0.0.1/8"])),
            ],
        );
        d.insert(Table::BgpRouter, &[("asn", Value::from(2i64))]);

        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.created, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].row_id, bad);
        assert!(rt.bgp_router(1).is_none());
        assert!(rt.bgp_router(2).is_some());
    }

    #[test]
    fn rejected_router_is_retried_until_accepted() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(7i64))]);
        rt.reject("7");
        assert_eq!(d.pass(&mut rec, &mut rt).failures.len(), 1);
        assert_eq!(rec.unsynced_rows(), 1);

        // A change to the row is another attempt, reported again.
        d.update(Table::BgpRouter, router, &[("router_id", Value::text("7.7.7.7"))]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.skipped, 0);
        assert_eq!(result.failures.len(), 1);

        // Silent retries until the runtime takes it.
        assert!(d.pass(&mut rec, &mut rt).failures.is_empty());
        rt.accept("7");
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.created, 1);
        assert_eq!(rec.unsynced_rows(), 0);
        assert_eq!(rt.bgp_router(7).unwrap().router_id, Some(Ipv4Addr::new(7, 7, 7, 7)));
    }

    #[test]
    fn fixed_router_is_created_with_its_waiting_neighbor() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(
            Table::BgpRouter,
            &[
                ("asn", Value::from(65001i64)),
                ("networks", Value::text_list(["10.0.0.1/8"])),
            ],
        );
        d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(65002i64)),
            ],
        );
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(rec.unsynced_rows(), 2);

        d.update(
            Table::BgpRouter,
            router,
            &[("networks", Value::text_list(["10.0.0.0/8"]))],
        );
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.created, 2);
        assert!(result.failures.is_empty());
        assert_eq!(rec.unsynced_rows(), 0);
        let state = rt.bgp_router(65001).unwrap();
        assert_eq!(state.networks.len(), 1);
        assert_eq!(state.neighbors[&addr("10.0.0.2")].remote_as, 65002);
    }

    #[test]
    fn failed_modification_is_reapplied_in_full() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(1i64))]);
        d.pass(&mut rec, &mut rt);

        d.update(
            Table::BgpRouter,
            router,
            &[
                ("maximum_paths", Value::from(4i64)),
                ("networks", Value::text_list(["10.0.0.1/8"])),
            ],
        );
        assert_eq!(d.pass(&mut rec, &mut rt).failures.len(), 1);
        assert_eq!(rec.unsynced_rows(), 1);

        d.update(
            Table::BgpRouter,
            router,
            &[("networks", Value::text_list(["10.0.0.0/8"]))],
        );
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.updated, 1);
        assert_eq!(rec.unsynced_rows(), 0);
        let state = rt.bgp_router(1).unwrap();
        assert_eq!(state.maximum_paths, 4);
        assert_eq!(state.networks.len(), 1);
    }

    #[test]
    fn neighbors_come_back_with_their_router() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(65001i64))]);
        d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(65002i64)),
            ],
        );
        d.pass(&mut rec, &mut rt);
        let row = Arc::clone(d.store.snapshot().get(Table::BgpRouter, router).unwrap());

        d.store.truncate_table(Table::BgpRouter);
        d.pass(&mut rec, &mut rt);
        assert_eq!(rt.instance_count(), 0);
        assert_eq!(rec.unsynced_rows(), 1);

        d.store.resync_table(Table::BgpRouter, &[row]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.created, 2);
        assert_eq!(rec.unsynced_rows(), 0);
        assert_eq!(rt.bgp_router(65001).unwrap().neighbors.len(), 1);
    }

    #[test]
    fn key_change_is_a_row_failure() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(Table::BgpRouter, &[("asn", Value::from(7i64))]);
        d.pass(&mut rec, &mut rt);

        d.update(Table::BgpRouter, router, &[("asn", Value::from(8i64))]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.failures.len(), 1);
        assert!(rt.bgp_router(7).is_some());
        assert!(rt.bgp_router(8).is_none());
    }

    #[test]
    fn deleted_router_can_be_declared_again() {
        let mut d = Driver::new();
        let mut rt = MemoryRuntime::new();
        let mut rec = BgpReconciler::new();
        let router = d.insert(
            Table::BgpRouter,
            &[("asn", Value::from(1i64)), ("maximum_paths", Value::from(4i64))],
        );
        d.insert(
            Table::BgpNeighbor,
            &[
                ("bgp_router", Value::Ref(router)),
                ("ip_address", Value::text("10.0.0.2")),
                ("remote_as", Value::from(3i64)),
            ],
        );
        d.pass(&mut rec, &mut rt);
        d.delete(Table::BgpRouter, router);
        d.pass(&mut rec, &mut rt);
        assert_eq!(rec.pending_teardown(), 1);

        d.insert(Table::BgpRouter, &[("asn", Value::from(1i64))]);
        let result = d.pass(&mut rec, &mut rt);
        assert_eq!(result.updated, 1);
        assert_eq!(rec.pending_teardown(), 0);
        assert_eq!(rt.bgp_router(1).unwrap().maximum_paths, DEFAULT_MAXIMUM_PATHS);
        assert_eq!(rt.bgp_router(1).unwrap().neighbors.len(), 1);
    }
}
