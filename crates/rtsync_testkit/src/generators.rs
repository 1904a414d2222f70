//! Property-based test generators using proptest.
//!
//! [`ConfigOp`] is one configuration edit drawn from a small key space so
//! that generated sequences insert, modify and delete the same instances
//! repeatedly. [`ConfigModel`] applies the edits to a store, keeping every
//! sequence consistent: references always point at live rows and keys are
//! unique.
//!
//! Rows may arrive before what they depend on. An OSPF interface can name
//! an area that no router maps yet, and an area row can exist before its
//! router maps it. Routers and static routes can be written with a bad
//! value and fixed by a later edit. Removing a parent removes the children
//! that depend on it in the same commit.

use crate::fixtures::{rows, transact, write_columns};
use proptest::prelude::*;
use rtsync_store::columns::{
    bgp_neighbor, bgp_router, ospf_area, ospf_interface, ospf_router, route,
};
use rtsync_store::{MemoryStore, RowId, Snapshot, StoreClient, Table, Transaction, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Routers, neighbors per router and static routes in the key space.
const ROUTERS: u8 = 3;
const NEIGHBORS: u8 = 3;
const STATICS: u8 = 4;
/// OSPF instances, area ids and interfaces in the key space.
const OSPF_ROUTERS: u8 = 2;
const AREAS: u8 = 3;
const INTERFACES: u8 = 3;

/// One configuration edit.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOp {
    /// Create router `r`.
    AddRouter(u8),
    /// Delete router `r` and its neighbors.
    RemoveRouter(u8),
    /// Set or clear the router id of router `r`.
    SetRouterId(u8, Option<u8>),
    /// Set the ECMP limit of router `r`.
    SetMaximumPaths(u8, u8),
    /// Create neighbor `n` of router `r` with a remote AS.
    AddNeighbor(u8, u8, u16),
    /// Delete neighbor `n` of router `r`.
    RemoveNeighbor(u8, u8),
    /// Change the remote AS of neighbor `n` of router `r`.
    SetRemoteAs(u8, u8, u16),
    /// Set or clear the description of neighbor `n` of router `r`.
    SetDescription(u8, u8, Option<String>),
    /// Create static route `p`.
    AddStatic(u8),
    /// Delete static route `p`.
    RemoveStatic(u8),
    /// Change the distance of static route `p`.
    SetDistance(u8, u8),
    /// Create router `r` announcing a network with host bits set.
    AddBrokenRouter(u8),
    /// Replace the networks of router `r` with a valid one.
    FixRouter(u8),
    /// Create static route `p` with a nexthop that is not an address.
    AddBrokenStatic(u8),
    /// Replace the nexthops of static route `p` with a valid one.
    FixStatic(u8),
    /// Create OSPF instance `t` with an empty area map.
    AddOspfRouter(u8),
    /// Delete OSPF instance `t` with its area rows and interfaces.
    RemoveOspfRouter(u8),
    /// Set or clear the router id of OSPF instance `t`.
    SetOspfRouterId(u8, Option<u8>),
    /// Create the area row `a` of instance `t`, not yet mapped.
    AddArea(u8, u8),
    /// Map area row `a` into the area map of instance `t`.
    MapArea(u8, u8),
    /// Drop area `a` from the map of instance `t` with its interfaces.
    UnmapArea(u8, u8),
    /// Delete area row `a` of instance `t` with its map entry and
    /// interfaces.
    RemoveArea(u8, u8),
    /// Make area `a` of instance `t` a stub area or a normal one.
    SetStub(u8, u8, bool),
    /// Create interface `i` in area `a` of instance `t`, whether or not
    /// the area is mapped.
    AddInterface(u8, u8, u8),
    /// Delete interface `i`.
    RemoveInterface(u8),
    /// Move interface `i` to mapped area `a` of instance `t`.
    MoveInterface(u8, u8, u8),
    /// Set the cost of interface `i`.
    SetCost(u8, u8),
}

/// ASN of router `r`.
pub fn router_asn(r: u8) -> u32 {
    65000 + u32::from(r)
}

/// Address of neighbor `n` of router `r`.
pub fn neighbor_address(r: u8, n: u8) -> String {
    format!("10.{r}.0.{}", u32::from(n) + 1)
}

/// Prefix of static route `p`.
pub fn static_prefix(p: u8) -> String {
    format!("10.{}.0.0/16", 100 + u32::from(p))
}

/// Instance tag of OSPF router `t`.
pub fn ospf_tag(t: u8) -> String {
    format!("ospf{t}")
}

/// Dotted area id of area `a`.
pub fn area_id(a: u8) -> String {
    format!("0.0.0.{a}")
}

/// Name of interface `i`.
pub fn interface_name(i: u8) -> String {
    format!("eth{i}")
}

fn router_network(r: u8) -> String {
    format!("10.{r}.0.0/16")
}

/// Strategy for one configuration edit.
pub fn config_op_strategy() -> impl Strategy<Value = ConfigOp> {
    let r = 0..ROUTERS;
    let n = 0..NEIGHBORS;
    let p = 0..STATICS;
    prop_oneof![
        3 => r.clone().prop_map(ConfigOp::AddRouter),
        1 => r.clone().prop_map(ConfigOp::RemoveRouter),
        2 => (r.clone(), prop::option::of(1..=9u8))
            .prop_map(|(r, id)| ConfigOp::SetRouterId(r, id)),
        1 => (r.clone(), 1..=8u8).prop_map(|(r, m)| ConfigOp::SetMaximumPaths(r, m)),
        3 => (r.clone(), n.clone(), 64512..64520u16)
            .prop_map(|(r, n, asn)| ConfigOp::AddNeighbor(r, n, asn)),
        1 => (r.clone(), n.clone()).prop_map(|(r, n)| ConfigOp::RemoveNeighbor(r, n)),
        2 => (r.clone(), n.clone(), 64512..64520u16)
            .prop_map(|(r, n, asn)| ConfigOp::SetRemoteAs(r, n, asn)),
        1 => (r.clone(), n, prop::option::of("[a-z]{1,8}"))
            .prop_map(|(r, n, d)| ConfigOp::SetDescription(r, n, d)),
        2 => p.clone().prop_map(ConfigOp::AddStatic),
        1 => p.clone().prop_map(ConfigOp::RemoveStatic),
        1 => (p.clone(), 1..=200u8).prop_map(|(p, d)| ConfigOp::SetDistance(p, d)),
        1 => r.clone().prop_map(ConfigOp::AddBrokenRouter),
        1 => r.prop_map(ConfigOp::FixRouter),
        1 => p.clone().prop_map(ConfigOp::AddBrokenStatic),
        1 => p.prop_map(ConfigOp::FixStatic),
        8 => ospf_op_strategy(),
    ]
}

/// Strategy for one OSPF edit.
pub fn ospf_op_strategy() -> impl Strategy<Value = ConfigOp> {
    let t = 0..OSPF_ROUTERS;
    let a = 0..AREAS;
    let i = 0..INTERFACES;
    prop_oneof![
        2 => t.clone().prop_map(ConfigOp::AddOspfRouter),
        1 => t.clone().prop_map(ConfigOp::RemoveOspfRouter),
        1 => (t.clone(), prop::option::of(1..=9u8))
            .prop_map(|(t, id)| ConfigOp::SetOspfRouterId(t, id)),
        3 => (t.clone(), a.clone()).prop_map(|(t, a)| ConfigOp::AddArea(t, a)),
        3 => (t.clone(), a.clone()).prop_map(|(t, a)| ConfigOp::MapArea(t, a)),
        1 => (t.clone(), a.clone()).prop_map(|(t, a)| ConfigOp::UnmapArea(t, a)),
        1 => (t.clone(), a.clone()).prop_map(|(t, a)| ConfigOp::RemoveArea(t, a)),
        1 => (t.clone(), a.clone(), any::<bool>())
            .prop_map(|(t, a, stub)| ConfigOp::SetStub(t, a, stub)),
        3 => (i.clone(), t.clone(), a.clone())
            .prop_map(|(i, t, a)| ConfigOp::AddInterface(i, t, a)),
        1 => i.clone().prop_map(ConfigOp::RemoveInterface),
        2 => (i.clone(), t, a).prop_map(|(i, t, a)| ConfigOp::MoveInterface(i, t, a)),
        1 => (i, 1..=50u8).prop_map(|(i, c)| ConfigOp::SetCost(i, c)),
    ]
}

/// Strategy for a sequence of up to `max` edits.
pub fn config_ops_strategy(max: usize) -> impl Strategy<Value = Vec<ConfigOp>> {
    prop::collection::vec(config_op_strategy(), 1..=max)
}

/// Live configuration rows created by applied edits.
#[derive(Debug, Default)]
pub struct ConfigModel {
    routers: BTreeMap<u8, RowId>,
    neighbors: BTreeMap<(u8, u8), RowId>,
    statics: BTreeMap<u8, RowId>,
    broken_routers: BTreeSet<u8>,
    broken_statics: BTreeSet<u8>,
    ospf_routers: BTreeMap<u8, RowId>,
    areas: BTreeMap<(u8, u8), RowId>,
    mapped: BTreeSet<(u8, u8)>,
    interfaces: BTreeMap<u8, ((u8, u8), RowId)>,
}

impl ConfigModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op` to `store` as one commit. Returns false, committing
    /// nothing, when the edit does not fit the current configuration.
    pub fn apply(&mut self, store: &MemoryStore, op: &ConfigOp) -> bool {
        match op {
            ConfigOp::AddRouter(r) => {
                if self.routers.contains_key(r) {
                    return false;
                }
                let id = write_columns(store, Table::BgpRouter, &rows::bgp_router(router_asn(*r)));
                self.routers.insert(*r, id);
            }
            ConfigOp::RemoveRouter(r) => {
                let Some(router) = self.routers.remove(r) else {
                    return false;
                };
                self.broken_routers.remove(r);
                let owned: Vec<(u8, u8)> =
                    self.neighbors.keys().filter(|(nr, _)| nr == r).copied().collect();
                let mut doomed = vec![(Table::BgpRouter, router)];
                for key in owned {
                    if let Some(id) = self.neighbors.remove(&key) {
                        doomed.push((Table::BgpNeighbor, id));
                    }
                }
                delete(store, &doomed);
            }
            ConfigOp::SetRouterId(r, id) => {
                let Some(row) = self.routers.get(r) else {
                    return false;
                };
                let value = id.map_or(Value::Null, |id| Value::text(format!("192.0.2.{id}")));
                update(store, Table::BgpRouter, *row, bgp_router::ROUTER_ID, value);
            }
            ConfigOp::SetMaximumPaths(r, paths) => {
                let Some(row) = self.routers.get(r) else {
                    return false;
                };
                let value = Value::from(u32::from(*paths));
                update(store, Table::BgpRouter, *row, bgp_router::MAXIMUM_PATHS, value);
            }
            ConfigOp::AddNeighbor(r, n, remote_as) => {
                let Some(router) = self.routers.get(r) else {
                    return false;
                };
                if self.neighbors.contains_key(&(*r, *n)) {
                    return false;
                }
                let columns =
                    rows::bgp_neighbor(*router, &neighbor_address(*r, *n), u32::from(*remote_as));
                let id = write_columns(store, Table::BgpNeighbor, &columns);
                self.neighbors.insert((*r, *n), id);
            }
            ConfigOp::RemoveNeighbor(r, n) => {
                let Some(id) = self.neighbors.remove(&(*r, *n)) else {
                    return false;
                };
                delete(store, &[(Table::BgpNeighbor, id)]);
            }
            ConfigOp::SetRemoteAs(r, n, remote_as) => {
                let Some(row) = self.neighbors.get(&(*r, *n)) else {
                    return false;
                };
                let value = Value::from(u32::from(*remote_as));
                update(store, Table::BgpNeighbor, *row, bgp_neighbor::REMOTE_AS, value);
            }
            ConfigOp::SetDescription(r, n, description) => {
                let Some(row) = self.neighbors.get(&(*r, *n)) else {
                    return false;
                };
                let value = description.as_deref().map_or(Value::Null, Value::text);
                update(store, Table::BgpNeighbor, *row, bgp_neighbor::DESCRIPTION, value);
            }
            ConfigOp::AddStatic(p) => {
                if self.statics.contains_key(p) {
                    return false;
                }
                let columns = rows::static_route(&static_prefix(*p), "192.0.2.254");
                let id = write_columns(store, Table::Route, &columns);
                self.statics.insert(*p, id);
            }
            ConfigOp::RemoveStatic(p) => {
                let Some(id) = self.statics.remove(p) else {
                    return false;
                };
                self.broken_statics.remove(p);
                delete(store, &[(Table::Route, id)]);
            }
            ConfigOp::SetDistance(p, distance) => {
                let Some(row) = self.statics.get(p) else {
                    return false;
                };
                let value = Value::from(u32::from(*distance));
                update(store, Table::Route, *row, route::DISTANCE, value);
            }
            ConfigOp::AddBrokenRouter(r) => {
                if self.routers.contains_key(r) {
                    return false;
                }
                let mut columns = rows::bgp_router(router_asn(*r));
                columns.push((bgp_router::NETWORKS, Value::text_list([format!("10.{r}.0.1/16")])));
                let id = write_columns(store, Table::BgpRouter, &columns);
                self.routers.insert(*r, id);
                self.broken_routers.insert(*r);
            }
            ConfigOp::FixRouter(r) => {
                if !self.broken_routers.remove(r) {
                    return false;
                }
                let value = Value::text_list([router_network(*r)]);
                update(store, Table::BgpRouter, self.routers[r], bgp_router::NETWORKS, value);
            }
            ConfigOp::AddBrokenStatic(p) => {
                if self.statics.contains_key(p) {
                    return false;
                }
                let columns = rows::static_route(&static_prefix(*p), "gateway");
                let id = write_columns(store, Table::Route, &columns);
                self.statics.insert(*p, id);
                self.broken_statics.insert(*p);
            }
            ConfigOp::FixStatic(p) => {
                if !self.broken_statics.remove(p) {
                    return false;
                }
                let value = Value::text_list(["192.0.2.254"]);
                update(store, Table::Route, self.statics[p], route::NEXTHOPS, value);
            }
            ConfigOp::AddOspfRouter(t) => {
                if self.ospf_routers.contains_key(t) {
                    return false;
                }
                let columns = rows::ospf_router(&ospf_tag(*t), &[]);
                let id = write_columns(store, Table::OspfRouter, &columns);
                self.ospf_routers.insert(*t, id);
            }
            ConfigOp::RemoveOspfRouter(t) => {
                let Some(router) = self.ospf_routers.remove(t) else {
                    return false;
                };
                let areas: Vec<u8> = self
                    .areas
                    .keys()
                    .filter(|(at, _)| at == t)
                    .map(|(_, a)| *a)
                    .collect();
                let mut doomed = vec![(Table::OspfRouter, router)];
                for a in areas {
                    doomed.extend(self.drop_interfaces((*t, a)));
                    self.mapped.remove(&(*t, a));
                    if let Some(id) = self.areas.remove(&(*t, a)) {
                        doomed.push((Table::OspfArea, id));
                    }
                }
                let tagged: Vec<u8> = self
                    .interfaces
                    .iter()
                    .filter(|(_, ((it, _), _))| it == t)
                    .map(|(i, _)| *i)
                    .collect();
                for i in tagged {
                    if let Some((_, id)) = self.interfaces.remove(&i) {
                        doomed.push((Table::OspfInterface, id));
                    }
                }
                delete(store, &doomed);
            }
            ConfigOp::SetOspfRouterId(t, id) => {
                let Some(row) = self.ospf_routers.get(t) else {
                    return false;
                };
                let value = id.map_or(Value::Null, |id| Value::text(format!("198.51.100.{id}")));
                update(store, Table::OspfRouter, *row, ospf_router::ROUTER_ID, value);
            }
            ConfigOp::AddArea(t, a) => {
                if self.areas.contains_key(&(*t, *a)) {
                    return false;
                }
                let id = write_columns(store, Table::OspfArea, &rows::ospf_area(&area_id(*a)));
                self.areas.insert((*t, *a), id);
            }
            ConfigOp::MapArea(t, a) => {
                let key = (*t, *a);
                let Some(router) = self.ospf_routers.get(t).copied() else {
                    return false;
                };
                if !self.areas.contains_key(&key) || !self.mapped.insert(key) {
                    return false;
                }
                let map = self.area_map(*t);
                update(store, Table::OspfRouter, router, ospf_router::AREAS, map);
            }
            ConfigOp::UnmapArea(t, a) => {
                let key = (*t, *a);
                if !self.mapped.remove(&key) {
                    return false;
                }
                let doomed = self.drop_interfaces(key);
                let router = self.ospf_routers[t];
                let map = self.area_map(*t);
                edit(store, |txn, snapshot| {
                    let row = snapshot.get(Table::OspfRouter, router).expect("live router");
                    txn.update(row, ospf_router::AREAS, map).expect("update");
                    delete_in(txn, snapshot, &doomed);
                });
            }
            ConfigOp::RemoveArea(t, a) => {
                let key = (*t, *a);
                let Some(area) = self.areas.remove(&key) else {
                    return false;
                };
                let mut doomed = self.drop_interfaces(key);
                doomed.push((Table::OspfArea, area));
                let remap = self
                    .mapped
                    .remove(&key)
                    .then(|| (self.ospf_routers[t], self.area_map(*t)));
                edit(store, |txn, snapshot| {
                    if let Some((router, map)) = remap {
                        let row = snapshot.get(Table::OspfRouter, router).expect("live router");
                        txn.update(row, ospf_router::AREAS, map).expect("update");
                    }
                    delete_in(txn, snapshot, &doomed);
                });
            }
            ConfigOp::SetStub(t, a, stub) => {
                let Some(row) = self.areas.get(&(*t, *a)) else {
                    return false;
                };
                let value = Value::text(if *stub { "stub" } else { "default" });
                update(store, Table::OspfArea, *row, ospf_area::AREA_TYPE, value);
            }
            ConfigOp::AddInterface(i, t, a) => {
                if self.interfaces.contains_key(i) {
                    return false;
                }
                let columns =
                    rows::ospf_interface(&interface_name(*i), &ospf_tag(*t), &area_id(*a));
                let id = write_columns(store, Table::OspfInterface, &columns);
                self.interfaces.insert(*i, ((*t, *a), id));
            }
            ConfigOp::RemoveInterface(i) => {
                let Some((_, id)) = self.interfaces.remove(i) else {
                    return false;
                };
                delete(store, &[(Table::OspfInterface, id)]);
            }
            ConfigOp::MoveInterface(i, t, a) => {
                let key = (*t, *a);
                if !self.mapped.contains(&key) {
                    return false;
                }
                let Some((area, id)) = self.interfaces.get_mut(i) else {
                    return false;
                };
                if *area == key {
                    return false;
                }
                *area = key;
                let id = *id;
                edit(store, |txn, snapshot| {
                    let row = snapshot.get(Table::OspfInterface, id).expect("live interface");
                    txn.update(row, ospf_interface::INSTANCE_TAG, Value::text(ospf_tag(*t)))
                        .expect("update");
                    txn.update(row, ospf_interface::AREA_ID, Value::text(area_id(*a)))
                        .expect("update");
                });
            }
            ConfigOp::SetCost(i, cost) => {
                let Some((_, row)) = self.interfaces.get(i) else {
                    return false;
                };
                let value = Value::from(u32::from(*cost));
                update(store, Table::OspfInterface, *row, ospf_interface::COST, value);
            }
        }
        true
    }

    /// The area map of instance `t` as currently mapped.
    fn area_map(&self, t: u8) -> Value {
        Value::map(
            self.mapped
                .iter()
                .filter(|(mt, _)| *mt == t)
                .map(|key| (area_id(key.1), Value::Ref(self.areas[key]))),
        )
    }

    /// Forgets the interfaces placed in `area` and returns their rows.
    fn drop_interfaces(&mut self, area: (u8, u8)) -> Vec<(Table, RowId)> {
        let placed: Vec<u8> = self
            .interfaces
            .iter()
            .filter(|(_, (at, _))| *at == area)
            .map(|(i, _)| *i)
            .collect();
        placed
            .into_iter()
            .filter_map(|i| self.interfaces.remove(&i))
            .map(|(_, id)| (Table::OspfInterface, id))
            .collect()
    }
}

fn update(store: &MemoryStore, table: Table, id: RowId, column: &str, value: Value) {
    let snapshot = store.snapshot();
    let row = snapshot.get(table, id).expect("live row");
    transact(store, |txn| txn.update(row, column, value).expect("update"));
}

fn delete(store: &MemoryStore, doomed: &[(Table, RowId)]) {
    edit(store, |txn, snapshot| delete_in(txn, snapshot, doomed));
}

fn delete_in(txn: &mut Transaction, snapshot: &Snapshot, doomed: &[(Table, RowId)]) {
    for (table, id) in doomed {
        let row = snapshot.get(*table, *id).expect("live row");
        txn.delete(row).expect("delete");
    }
}

/// Runs `f` against the current snapshot inside one commit.
fn edit(store: &MemoryStore, f: impl FnOnce(&mut Transaction, &Snapshot)) {
    let snapshot = store.snapshot();
    transact(store, |txn| f(txn, &snapshot));
}
