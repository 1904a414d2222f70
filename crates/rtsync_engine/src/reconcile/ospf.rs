//! OSPF reconciler: `OSPF_Router`, `OSPF_Area` and `OSPF_Interface` rows.
//!
//! Areas are owned by routers through the router's `areas` map; an area
//! instance exists while some router row maps its id to a live area row.
//! Dropping the map entry, deleting the area row or deleting the router
//! all release the area, deferred while interfaces are still attached.
//!
//! An interface may arrive before its area is mapped. It stays unsynced
//! and is created on the first pass that finds its area.

use super::{key_changed, Domain, PassInput, ReconcileResult, Reconciler, Unsynced};
use crate::change::ChangeRecord;
use crate::error::{EngineError, EngineResult};
use crate::fields;
use crate::runtime::{AreaType, AuthType, InterfaceParam, ProtocolRuntime, RuntimeError};
use rtsync_store::columns::{ospf_area, ospf_interface, ospf_router};
use rtsync_store::{Row, RowId, Snapshot, Table};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

type AreaKey = (String, Ipv4Addr);

/// An area a router maps, to be made live this pass.
struct AreaTarget {
    tag: String,
    area_id: Ipv4Addr,
    row: RowId,
    /// Whether the router or area row changed this pass.
    changed: bool,
}

/// Every area mapped by a router row.
fn area_targets(tag: &str, row: &Row, changed: bool) -> EngineResult<Vec<AreaTarget>> {
    Ok(fields::area_map(row, ospf_router::AREAS)?
        .into_iter()
        .map(|(area_id, area_row)| AreaTarget {
            tag: tag.to_string(),
            area_id,
            row: area_row,
            changed,
        })
        .collect())
}

const DEFAULT_HELLO_INTERVAL: u32 = 10;
const DEFAULT_DEAD_INTERVAL: u32 = 40;
const DEFAULT_COST: u32 = 10;
const DEFAULT_PRIORITY: u8 = 1;

struct RouterSpec {
    tag: String,
    router_id: Option<Ipv4Addr>,
    redistribute: BTreeSet<String>,
}

impl RouterSpec {
    /// Parses the router columns. The area map is only validated here;
    /// areas are reconciled from it separately.
    fn parse(row: &Row) -> EngineResult<Self> {
        fields::area_map(row, ospf_router::AREAS)?;
        Ok(Self {
            tag: fields::text(row, ospf_router::INSTANCE_TAG)?.to_string(),
            router_id: fields::optional_ipv4(row, ospf_router::ROUTER_ID)?,
            redistribute: fields::text_set(row, ospf_router::REDISTRIBUTE)?,
        })
    }
}

struct AreaSpec {
    area_id: Ipv4Addr,
    area_type: AreaType,
    auth_type: AuthType,
}

impl AreaSpec {
    fn parse(row: &Row) -> EngineResult<Self> {
        let area_type = match fields::optional_text(row, ospf_area::AREA_TYPE)? {
            None => AreaType::default(),
            Some(s) => s.parse::<AreaType>().map_err(|e| {
                EngineError::malformed(Table::OspfArea, ospf_area::AREA_TYPE, e)
            })?,
        };
        let auth_type = match fields::optional_text(row, ospf_area::AUTH_TYPE)? {
            None => AuthType::default(),
            Some(s) => s.parse::<AuthType>().map_err(|e| {
                EngineError::malformed(Table::OspfArea, ospf_area::AUTH_TYPE, e)
            })?,
        };
        Ok(Self {
            area_id: fields::ipv4(row, ospf_area::AREA_ID)?,
            area_type,
            auth_type,
        })
    }
}

struct InterfaceSpec {
    name: String,
    tag: String,
    area_id: Ipv4Addr,
    hello_interval: Option<u32>,
    dead_interval: Option<u32>,
    cost: Option<u32>,
    priority: Option<u8>,
    passive: Option<bool>,
}

impl InterfaceSpec {
    fn parse(row: &Row) -> EngineResult<Self> {
        Ok(Self {
            name: fields::text(row, ospf_interface::NAME)?.to_string(),
            tag: fields::text(row, ospf_interface::INSTANCE_TAG)?.to_string(),
            area_id: fields::ipv4(row, ospf_interface::AREA_ID)?,
            hello_interval: fields::optional_u32(row, ospf_interface::HELLO_INTERVAL)?,
            dead_interval: fields::optional_u32(row, ospf_interface::DEAD_INTERVAL)?,
            cost: fields::optional_u32(row, ospf_interface::COST)?,
            priority: fields::optional_u8(row, ospf_interface::PRIORITY)?,
            passive: fields::optional_bool(row, ospf_interface::PASSIVE)?,
        })
    }

    /// The parameter a column maps to, with its default when unset.
    fn param(&self, column: &str) -> Option<InterfaceParam> {
        Some(match column {
            ospf_interface::HELLO_INTERVAL => {
                InterfaceParam::HelloInterval(self.hello_interval.unwrap_or(DEFAULT_HELLO_INTERVAL))
            }
            ospf_interface::DEAD_INTERVAL => {
                InterfaceParam::DeadInterval(self.dead_interval.unwrap_or(DEFAULT_DEAD_INTERVAL))
            }
            ospf_interface::COST => InterfaceParam::Cost(self.cost.unwrap_or(DEFAULT_COST)),
            ospf_interface::PRIORITY => {
                InterfaceParam::Priority(self.priority.unwrap_or(DEFAULT_PRIORITY))
            }
            ospf_interface::PASSIVE => InterfaceParam::Passive(self.passive.unwrap_or(false)),
            _ => return None,
        })
    }

    /// Parameters declared explicitly.
    fn declared_params(&self) -> Vec<InterfaceParam> {
        let mut params = Vec::new();
        if let Some(v) = self.hello_interval {
            params.push(InterfaceParam::HelloInterval(v));
        }
        if let Some(v) = self.dead_interval {
            params.push(InterfaceParam::DeadInterval(v));
        }
        if let Some(v) = self.cost {
            params.push(InterfaceParam::Cost(v));
        }
        if let Some(v) = self.priority {
            params.push(InterfaceParam::Priority(v));
        }
        if let Some(v) = self.passive {
            params.push(InterfaceParam::Passive(v));
        }
        params
    }
}

const INTERFACE_PARAMS: [&str; 5] = [
    ospf_interface::HELLO_INTERVAL,
    ospf_interface::DEAD_INTERVAL,
    ospf_interface::COST,
    ospf_interface::PRIORITY,
    ospf_interface::PASSIVE,
];

/// Keeps OSPF routers, areas and interfaces in line with their rows.
#[derive(Debug)]
pub struct OspfReconciler {
    routers: HashMap<RowId, String>,
    areas: HashMap<RowId, AreaKey>,
    interfaces: HashMap<RowId, String>,
    deferred_areas: BTreeSet<AreaKey>,
    deferred_routers: BTreeSet<String>,
    unsynced_routers: Unsynced,
    unsynced_areas: Unsynced,
    unsynced_interfaces: Unsynced,
}

impl Default for OspfReconciler {
    fn default() -> Self {
        Self {
            routers: HashMap::new(),
            areas: HashMap::new(),
            interfaces: HashMap::new(),
            deferred_areas: BTreeSet::new(),
            deferred_routers: BTreeSet::new(),
            unsynced_routers: Unsynced::new(Table::OspfRouter),
            unsynced_areas: Unsynced::new(Table::OspfArea),
            unsynced_interfaces: Unsynced::new(Table::OspfInterface),
        }
    }
}

impl OspfReconciler {
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
        for name in runtime.ospf_interfaces() {
            match runtime.destroy_ospf_interface(&name) {
                Ok(()) => result.destroyed += 1,
                Err(e) => warn!(interface = %name, error = %e, "interface teardown failed"),
            }
        }
        let tags = runtime.ospf_routers();
        for tag in &tags {
            let areas: Vec<Ipv4Addr> = runtime
                .ospf_router(tag)
                .map(|r| r.areas.keys().copied().collect())
                .unwrap_or_default();
            for area_id in areas {
                match runtime.destroy_ospf_area(tag, area_id) {
                    Ok(()) => result.destroyed += 1,
                    Err(e) => warn!(%tag, %area_id, error = %e, "area teardown failed"),
                }
            }
            match runtime.destroy_ospf_router(tag) {
                Ok(()) => result.destroyed += 1,
                Err(e) => warn!(%tag, error = %e, "router teardown failed"),
            }
        }
        if !tags.is_empty() {
            info!(routers = tags.len(), "OSPF router table empty, tore down all instances");
        }
        self.routers.clear();
        self.areas.clear();
        self.interfaces.clear();
        self.deferred_areas.clear();
        self.deferred_routers.clear();
        // Surviving areas and interfaces come back with their router.
        self.unsynced_routers.reset_to_live(snapshot);
        self.unsynced_areas.reset_to_live(snapshot);
        self.unsynced_interfaces.reset_to_live(snapshot);
    }

    fn retry_deferred(
        &mut self,
        input: &PassInput<'_>,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) {
        let areas: Vec<AreaKey> = self.deferred_areas.iter().cloned().collect();
        for key in areas {
            if input.index.ospf_area(&key.0, key.1).is_some() {
                debug!(tag = %key.0, area_id = %key.1, "deferred area declared again");
                self.deferred_areas.remove(&key);
                continue;
            }
            let attached = runtime
                .ospf_router(&key.0)
                .and_then(|r| r.areas.get(&key.1))
                .map(|a| a.interfaces.len());
            match attached {
                None => {
                    self.deferred_areas.remove(&key);
                }
                Some(0) => match runtime.destroy_ospf_area(&key.0, key.1) {
                    Ok(()) => {
                        info!(tag = %key.0, area_id = %key.1, "destroyed deferred area");
                        result.destroyed += 1;
                        self.deferred_areas.remove(&key);
                    }
                    Err(e) => warn!(
                        tag = %key.0,
                        area_id = %key.1,
                        error = %e,
                        "deferred area teardown failed"
                    ),
                },
                Some(_) => {}
            }
        }

        let routers: Vec<String> = self.deferred_routers.iter().cloned().collect();
        for tag in routers {
            let redeclared = input.index.ospf_router(&tag).is_some_and(|row| {
                row.inserted_since(input.changes.from_seq())
                    || self.routers.get(&row.id()) == Some(&tag)
            });
            if redeclared {
                self.deferred_routers.remove(&tag);
                continue;
            }
            match runtime.ospf_router(&tag).map(|r| r.areas.len()) {
                None => {
                    self.deferred_routers.remove(&tag);
                }
                Some(0) => match runtime.destroy_ospf_router(&tag) {
                    Ok(()) => {
                        info!(%tag, "destroyed deferred router");
                        result.destroyed += 1;
                        self.deferred_routers.remove(&tag);
                    }
                    Err(e) => warn!(%tag, error = %e, "deferred router teardown failed"),
                },
                Some(_) => {}
            }
        }
    }

    /// Tears an area down, or defers it while interfaces are attached.
    fn release_area(
        &mut self,
        key: AreaKey,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        self.areas.retain(|_, bound| *bound != key);
        if self.deferred_areas.contains(&key) {
            return Ok(());
        }
        let attached = runtime
            .ospf_router(&key.0)
            .and_then(|r| r.areas.get(&key.1))
            .map(|a| a.interfaces.len());
        match attached {
            None => {
                debug!(tag = %key.0, area_id = %key.1, "released area not found");
                result.skipped += 1;
            }
            Some(0) => {
                runtime.destroy_ospf_area(&key.0, key.1)?;
                debug!(tag = %key.0, area_id = %key.1, "destroyed area");
                result.destroyed += 1;
            }
            Some(interfaces) => {
                info!(tag = %key.0, area_id = %key.1, interfaces, "area teardown deferred");
                self.deferred_areas.insert(key);
                result.deferred += 1;
            }
        }
        Ok(())
    }

    fn delete_interface(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(name) = self.interfaces.remove(&rec.row_id) else {
            debug!(row = %rec.row_id, "deleted interface was never bound");
            result.skipped += 1;
            return Ok(());
        };
        if runtime.ospf_interface(&name).is_none() {
            result.skipped += 1;
            return Ok(());
        }
        runtime.destroy_ospf_interface(&name)?;
        debug!(interface = %name, "destroyed interface");
        result.destroyed += 1;
        Ok(())
    }

    fn delete_area(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        match self.areas.get(&rec.row_id).cloned() {
            Some(key) => self.release_area(key, runtime, result),
            None => {
                debug!(row = %rec.row_id, "deleted area was never bound");
                result.skipped += 1;
                Ok(())
            }
        }
    }

    /// Releases areas a modified router no longer maps, and unbinds area
    /// rows whose map entry now points at another row.
    fn prune_router_areas(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(tag) = self.routers.get(&rec.row_id).cloned() else {
            return Ok(());
        };
        let map = fields::area_map(&rec.row, ospf_router::AREAS)?;
        self.areas
            .retain(|row_id, key| key.0 != tag || map.get(&key.1) == Some(row_id));
        let live: Vec<Ipv4Addr> = runtime
            .ospf_router(&tag)
            .map(|r| r.areas.keys().copied().collect())
            .unwrap_or_default();
        for area_id in live {
            if !map.contains_key(&area_id) {
                self.release_area((tag.clone(), area_id), runtime, result)?;
            }
        }
        Ok(())
    }

    fn delete_router(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(tag) = self.routers.remove(&rec.row_id) else {
            debug!(row = %rec.row_id, "deleted router was never bound");
            result.skipped += 1;
            return Ok(());
        };
        let live: Vec<Ipv4Addr> = match runtime.ospf_router(&tag) {
            Some(router) => router.areas.keys().copied().collect(),
            None => {
                result.skipped += 1;
                return Ok(());
            }
        };
        for area_id in live {
            self.release_area((tag.clone(), area_id), runtime, result)?;
        }
        match runtime.ospf_router(&tag).map(|r| r.areas.len()) {
            Some(0) => {
                runtime.destroy_ospf_router(&tag)?;
                debug!(%tag, "destroyed router");
                result.destroyed += 1;
            }
            Some(areas) => {
                info!(%tag, areas, "router teardown deferred");
                self.deferred_routers.insert(tag);
                result.deferred += 1;
            }
            None => {}
        }
        Ok(())
    }

    fn insert_router(
        &mut self,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<String> {
        let spec = RouterSpec::parse(row)?;
        if let Some(bound) = self.routers.get(&row.id()) {
            if *bound != spec.tag {
                return Err(key_changed(
                    Table::OspfRouter,
                    ospf_router::INSTANCE_TAG,
                    bound,
                    &spec.tag,
                ));
            }
        }
        let fresh = runtime.ospf_router(&spec.tag).is_none();
        if fresh {
            runtime.create_ospf_router(&spec.tag)?;
        } else {
            let taken = self
                .routers
                .iter()
                .any(|(id, tag)| *tag == spec.tag && *id != row.id());
            if taken {
                return Err(RuntimeError::already_exists("ospf router", &spec.tag).into());
            }
            self.deferred_routers.remove(&spec.tag);
        }
        self.routers.insert(row.id(), spec.tag.clone());
        if !fresh || spec.router_id.is_some() {
            runtime.set_ospf_router_id(&spec.tag, spec.router_id)?;
        }
        if !fresh || !spec.redistribute.is_empty() {
            runtime.set_ospf_redistribute(&spec.tag, spec.redistribute)?;
        }
        if fresh {
            debug!(tag = %spec.tag, "created router");
            result.created += 1;
        } else {
            debug!(tag = %spec.tag, "re-initialized router");
            result.updated += 1;
        }
        Ok(spec.tag)
    }

    /// Makes sure the area mapped under `area_id` by router `tag` exists
    /// and is bound to `area_row`.
    fn ensure_area(
        &mut self,
        input: &PassInput<'_>,
        tag: &str,
        area_id: Ipv4Addr,
        area_row: RowId,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let row = input
            .snapshot
            .get(Table::OspfArea, area_row)
            .ok_or_else(|| EngineError::missing(Table::OspfArea, area_row))?;
        let spec = AreaSpec::parse(row)?;
        if spec.area_id != area_id {
            return Err(EngineError::malformed(
                Table::OspfArea,
                ospf_area::AREA_ID,
                format!("area id {} does not match router map key {area_id}", spec.area_id),
            ));
        }
        let key = (tag.to_string(), area_id);
        let live = runtime
            .ospf_router(tag)
            .is_some_and(|r| r.areas.contains_key(&area_id));
        if live && self.areas.get(&area_row) == Some(&key) {
            return Ok(());
        }

        if live {
            let taken = self
                .areas
                .iter()
                .any(|(id, bound)| *bound == key && *id != area_row);
            if taken {
                let key = format!("{tag}/{area_id}");
                return Err(RuntimeError::already_exists("ospf area", key).into());
            }
            self.deferred_areas.remove(&key);
            runtime.set_ospf_area_type(tag, area_id, spec.area_type)?;
            runtime.set_ospf_auth_type(tag, area_id, spec.auth_type)?;
            debug!(%tag, %area_id, "re-initialized area");
            result.updated += 1;
        } else {
            runtime.create_ospf_area(tag, area_id)?;
            if spec.area_type != AreaType::default() {
                runtime.set_ospf_area_type(tag, area_id, spec.area_type)?;
            }
            if spec.auth_type != AuthType::default() {
                runtime.set_ospf_auth_type(tag, area_id, spec.auth_type)?;
            }
            debug!(%tag, %area_id, "created area");
            result.created += 1;
        }
        self.areas.insert(area_row, key);
        Ok(())
    }

    fn insert_interface(
        &mut self,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let spec = InterfaceSpec::parse(row)?;
        if let Some(bound) = self.interfaces.get(&row.id()) {
            if *bound != spec.name {
                return Err(key_changed(
                    Table::OspfInterface,
                    ospf_interface::NAME,
                    bound,
                    &spec.name,
                ));
            }
            let moved = runtime
                .ospf_interface(&spec.name)
                .map(|live| live.instance_tag != spec.tag || live.area_id != spec.area_id);
            if let Some(moved) = moved {
                if moved {
                    runtime.attach_ospf_interface(&spec.name, &spec.tag, spec.area_id)?;
                }
                for column in INTERFACE_PARAMS {
                    if let Some(param) = spec.param(column) {
                        runtime.set_ospf_interface_param(&spec.name, param)?;
                    }
                }
                debug!(interface = %spec.name, "re-initialized interface");
                result.updated += 1;
                return Ok(());
            }
        }
        runtime.create_ospf_interface(&spec.name, &spec.tag, spec.area_id)?;
        self.interfaces.insert(row.id(), spec.name.clone());
        for param in spec.declared_params() {
            runtime.set_ospf_interface_param(&spec.name, param)?;
        }
        debug!(
            interface = %spec.name,
            tag = %spec.tag,
            area_id = %spec.area_id,
            "created interface"
        );
        result.created += 1;
        Ok(())
    }

    fn modify_router(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(tag) = self.routers.get(&rec.row_id).cloned() else {
            debug!(row = %rec.row_id, "modification for unbound router");
            result.skipped += 1;
            return Ok(());
        };
        let spec = RouterSpec::parse(&rec.row)?;
        if spec.tag != tag {
            return Err(key_changed(Table::OspfRouter, ospf_router::INSTANCE_TAG, tag, spec.tag));
        }
        if runtime.ospf_router(&tag).is_none() {
            result.skipped += 1;
            return Ok(());
        }
        let mut touched = false;
        if rec.changed(ospf_router::ROUTER_ID) {
            runtime.set_ospf_router_id(&tag, spec.router_id)?;
            touched = true;
        }
        if rec.changed(ospf_router::REDISTRIBUTE) {
            runtime.set_ospf_redistribute(&tag, spec.redistribute)?;
            touched = true;
        }
        if touched {
            debug!(%tag, columns = ?rec.changed_columns, "updated router");
            result.updated += 1;
        }
        Ok(())
    }

    fn modify_area(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some((tag, area_id)) = self.areas.get(&rec.row_id).cloned() else {
            debug!(row = %rec.row_id, "modification for unbound area");
            result.skipped += 1;
            return Ok(());
        };
        let spec = AreaSpec::parse(&rec.row)?;
        if spec.area_id != area_id {
            return Err(key_changed(Table::OspfArea, ospf_area::AREA_ID, area_id, spec.area_id));
        }
        let live = runtime
            .ospf_router(&tag)
            .is_some_and(|r| r.areas.contains_key(&area_id));
        if !live {
            result.skipped += 1;
            return Ok(());
        }
        let mut touched = false;
        if rec.changed(ospf_area::AREA_TYPE) {
            runtime.set_ospf_area_type(&tag, area_id, spec.area_type)?;
            touched = true;
        }
        if rec.changed(ospf_area::AUTH_TYPE) {
            runtime.set_ospf_auth_type(&tag, area_id, spec.auth_type)?;
            touched = true;
        }
        if touched {
            debug!(%tag, %area_id, columns = ?rec.changed_columns, "updated area");
            result.updated += 1;
        }
        Ok(())
    }

    fn modify_interface(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(name) = self.interfaces.get(&rec.row_id).cloned() else {
            debug!(row = %rec.row_id, "modification for unbound interface");
            result.skipped += 1;
            return Ok(());
        };
        let spec = InterfaceSpec::parse(&rec.row)?;
        if spec.name != name {
            return Err(key_changed(Table::OspfInterface, ospf_interface::NAME, name, spec.name));
        }
        let Some(live) = runtime.ospf_interface(&name) else {
            result.skipped += 1;
            return Ok(());
        };
        let moved = live.instance_tag != spec.tag || live.area_id != spec.area_id;

        let mut touched = false;
        if moved
            && (rec.changed(ospf_interface::INSTANCE_TAG) || rec.changed(ospf_interface::AREA_ID))
        {
            runtime.attach_ospf_interface(&name, &spec.tag, spec.area_id)?;
            info!(interface = %name, tag = %spec.tag, area_id = %spec.area_id, "moved interface");
            touched = true;
        }
        for column in INTERFACE_PARAMS {
            if rec.changed(column) {
                if let Some(param) = spec.param(column) {
                    runtime.set_ospf_interface_param(&name, param)?;
                    touched = true;
                }
            }
        }
        if touched {
            debug!(interface = %name, columns = ?rec.changed_columns, "updated interface");
            result.updated += 1;
        }
        Ok(())
    }
}

impl Reconciler for OspfReconciler {
    fn domain(&self) -> Domain {
        Domain::Ospf
    }

    fn apply(
        &mut self,
        input: &PassInput<'_>,
        runtime: &mut dyn ProtocolRuntime,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        if input.snapshot.is_empty(Table::OspfRouter) {
            self.teardown_all(input.snapshot, runtime, &mut result);
            return result;
        }
        let changes = input.changes;

        self.retry_deferred(input, runtime, &mut result);
        for rec in changes.deleted(Table::OspfInterface) {
            self.unsynced_interfaces.remove(rec.row_id);
            if let Err(e) = self.delete_interface(rec, runtime, &mut result) {
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.deleted(Table::OspfArea) {
            self.unsynced_areas.remove(rec.row_id);
            if let Err(e) = self.delete_area(rec, runtime, &mut result) {
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.modified(Table::OspfRouter) {
            if rec.changed(ospf_router::AREAS) {
                if let Err(e) = self.prune_router_areas(rec, runtime, &mut result) {
                    result.fail(rec.table, rec.row_id, e);
                }
            }
        }
        for rec in changes.deleted(Table::OspfRouter) {
            self.unsynced_routers.remove(rec.row_id);
            if let Err(e) = self.delete_router(rec, runtime, &mut result) {
                result.fail(rec.table, rec.row_id, e);
            }
        }
        self.retry_deferred(input, runtime, &mut result);

        let routers = self
            .unsynced_routers
            .attempts(input, |id| self.routers.contains_key(&id));
        let mut targets = Vec::new();
        for attempt in &routers {
            let initialized = self
                .insert_router(&attempt.row, runtime, &mut result)
                .and_then(|tag| area_targets(&tag, &attempt.row, attempt.changed));
            match initialized {
                Ok(mapped) => {
                    self.unsynced_routers.remove(attempt.row.id());
                    targets.extend(mapped);
                }
                Err(e) => {
                    self.unsynced_routers.insert(attempt.row.id());
                    result.fail_attempt(attempt, e);
                }
            }
        }
        let mut initialized: HashSet<RowId> = routers.iter().map(|a| a.row.id()).collect();
        for rec in changes.modified(Table::OspfRouter) {
            if initialized.contains(&rec.row_id) || !rec.changed(ospf_router::AREAS) {
                continue;
            }
            let Some(tag) = self.routers.get(&rec.row_id) else {
                continue;
            };
            match area_targets(tag, &rec.row, true) {
                Ok(mapped) => targets.extend(mapped),
                Err(e) => {
                    self.unsynced_routers.insert(rec.row_id);
                    result.fail(rec.table, rec.row_id, e);
                }
            }
        }

        let areas = self
            .unsynced_areas
            .attempts(input, |id| self.areas.contains_key(&id));
        for attempt in &areas {
            let id = attempt.row.id();
            initialized.insert(id);
            // A bound area here is stale and gets initialized again.
            self.areas.remove(&id);
            if let Some(target) = targets.iter_mut().find(|t| t.row == id) {
                target.changed |= attempt.changed;
                continue;
            }
            match input.index.area_owner(id) {
                Some((tag, area_id)) => targets.push(AreaTarget {
                    tag: tag.clone(),
                    area_id: *area_id,
                    row: id,
                    changed: attempt.changed,
                }),
                None => {
                    debug!(row = %id, "area row not referenced by any router");
                    self.unsynced_areas.remove(id);
                }
            }
        }
        for target in targets {
            let ensured = self.ensure_area(
                input,
                &target.tag,
                target.area_id,
                target.row,
                runtime,
                &mut result,
            );
            match ensured {
                Ok(()) => self.unsynced_areas.remove(target.row),
                Err(e) => {
                    self.unsynced_areas.insert(target.row);
                    if target.changed {
                        result.fail(Table::OspfArea, target.row, e);
                    } else {
                        debug!(row = %target.row, error = %e, "unsynced area still failing");
                    }
                }
            }
        }

        let interfaces = self
            .unsynced_interfaces
            .attempts(input, |id| self.interfaces.contains_key(&id));
        for attempt in &interfaces {
            initialized.insert(attempt.row.id());
            match self.insert_interface(&attempt.row, runtime, &mut result) {
                Ok(()) => self.unsynced_interfaces.remove(attempt.row.id()),
                Err(e) => {
                    self.unsynced_interfaces.insert(attempt.row.id());
                    result.fail_attempt(attempt, e);
                }
            }
        }

        for rec in changes.modified(Table::OspfRouter) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify_router(rec, runtime, &mut result) {
                self.unsynced_routers.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.modified(Table::OspfArea) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify_area(rec, runtime, &mut result) {
                self.unsynced_areas.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        for rec in changes.modified(Table::OspfInterface) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify_interface(rec, runtime, &mut result) {
                self.unsynced_interfaces.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        self.retry_deferred(input, runtime, &mut result);
        result
    }

    fn pending_teardown(&self) -> usize {
        self.deferred_areas.len() + self.deferred_routers.len()
    }

    fn unsynced_rows(&self) -> usize {
        self.unsynced_routers.len() + self.unsynced_areas.len() + self.unsynced_interfaces.len()
    }
}
