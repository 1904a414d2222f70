//! In-memory protocol runtime.

use super::{
    AreaType, AuthType, BgpNeighborState, BgpRouterState, BgpRuntime, InterfaceParam,
    OspfAreaState, OspfInterfaceState, OspfRouterState, OspfRuntime, ProtocolEvent,
    ProtocolRuntime, RibRuntime, RuntimeError, RuntimeResult, StaticRoute,
};
use crate::prefix::Prefix;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOp {
    /// Method name.
    pub call: &'static str,
    /// Key of the instance the call targeted.
    pub key: String,
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.call, self.key)
    }
}

/// A protocol runtime that keeps instances in maps and runs no protocol.
///
/// Every mutating call is recorded so tests can assert exactly which
/// operations a pass performed. Events are queued with
/// [`MemoryRuntime::emit`] and handed to the engine by
/// [`ProtocolRuntime::drain_events`].
#[derive(Debug, Default, Serialize)]
pub struct MemoryRuntime {
    bgp: BTreeMap<u32, BgpRouterState>,
    ospf: BTreeMap<String, OspfRouterState>,
    interfaces: BTreeMap<String, OspfInterfaceState>,
    statics: BTreeMap<Prefix, StaticRoute>,
    #[serde(skip)]
    events: VecDeque<ProtocolEvent>,
    #[serde(skip)]
    ops: Vec<RuntimeOp>,
    #[serde(skip)]
    rejected: HashSet<String>,
}

const BGP_ROUTER: &str = "bgp router";
const BGP_NEIGHBOR: &str = "bgp neighbor";
const OSPF_ROUTER: &str = "ospf router";
const OSPF_AREA: &str = "ospf area";
const OSPF_INTERFACE: &str = "ospf interface";
const STATIC_ROUTE: &str = "static route";

impl MemoryRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the next [`ProtocolRuntime::drain_events`].
    pub fn emit(&mut self, event: ProtocolEvent) {
        self.events.push_back(event);
    }

    /// Makes every create call for `key` fail with
    /// [`RuntimeError::Rejected`].
    pub fn reject(&mut self, key: impl Into<String>) {
        self.rejected.insert(key.into());
    }

    /// Lets create calls for `key` succeed again.
    pub fn accept(&mut self, key: &str) {
        self.rejected.remove(key);
    }

    /// Recorded calls, oldest first.
    #[must_use]
    pub fn ops(&self) -> &[RuntimeOp] {
        &self.ops
    }

    /// Takes and clears the recorded calls.
    pub fn take_ops(&mut self) -> Vec<RuntimeOp> {
        std::mem::take(&mut self.ops)
    }

    /// Number of live instances of every kind.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        let neighbors: usize = self.bgp.values().map(|r| r.neighbors.len()).sum();
        let areas: usize = self.ospf.values().map(|r| r.areas.len()).sum();
        self.bgp.len()
            + neighbors
            + self.ospf.len()
            + areas
            + self.interfaces.len()
            + self.statics.len()
    }

    /// Compares live state only, ignoring the call log and event queue.
    #[must_use]
    pub fn same_state(&self, other: &MemoryRuntime) -> bool {
        self.bgp == other.bgp
            && self.ospf == other.ospf
            && self.interfaces == other.interfaces
            && self.statics == other.statics
    }

    fn record(&mut self, call: &'static str, key: impl fmt::Display) {
        self.ops.push(RuntimeOp {
            call,
            key: key.to_string(),
        });
    }

    fn check_rejected(&self, kind: &'static str, key: &str) -> RuntimeResult<()> {
        if self.rejected.contains(key) {
            return Err(RuntimeError::rejected(kind, key, "rejected by runtime"));
        }
        Ok(())
    }

    fn router_mut(&mut self, asn: u32) -> RuntimeResult<&mut BgpRouterState> {
        self.bgp
            .get_mut(&asn)
            .ok_or_else(|| RuntimeError::not_found(BGP_ROUTER, asn))
    }

    fn neighbor_mut(&mut self, asn: u32, address: IpAddr) -> RuntimeResult<&mut BgpNeighborState> {
        self.router_mut(asn)?
            .neighbors
            .get_mut(&address)
            .ok_or_else(|| RuntimeError::not_found(BGP_NEIGHBOR, format!("{asn}/{address}")))
    }

    fn ospf_mut(&mut self, tag: &str) -> RuntimeResult<&mut OspfRouterState> {
        self.ospf
            .get_mut(tag)
            .ok_or_else(|| RuntimeError::not_found(OSPF_ROUTER, tag))
    }

    fn area_mut(&mut self, tag: &str, area_id: Ipv4Addr) -> RuntimeResult<&mut OspfAreaState> {
        self.ospf_mut(tag)?
            .areas
            .get_mut(&area_id)
            .ok_or_else(|| RuntimeError::not_found(OSPF_AREA, format!("{tag}/{area_id}")))
    }

    fn static_mut(&mut self, prefix: &Prefix) -> RuntimeResult<&mut StaticRoute> {
        self.statics
            .get_mut(prefix)
            .ok_or_else(|| RuntimeError::not_found(STATIC_ROUTE, prefix))
    }
}

impl BgpRuntime for MemoryRuntime {
    fn bgp_router(&self, asn: u32) -> Option<&BgpRouterState> {
        self.bgp.get(&asn)
    }

    fn bgp_routers(&self) -> Vec<u32> {
        self.bgp.keys().copied().collect()
    }

    fn create_bgp_router(&mut self, asn: u32) -> RuntimeResult<()> {
        self.check_rejected(BGP_ROUTER, &asn.to_string())?;
        if self.bgp.contains_key(&asn) {
            return Err(RuntimeError::already_exists(BGP_ROUTER, asn));
        }
        self.bgp.insert(
            asn,
            BgpRouterState {
                asn,
                router_id: None,
                networks: BTreeSet::new(),
                redistribute: BTreeSet::new(),
                maximum_paths: 1,
                neighbors: BTreeMap::new(),
            },
        );
        self.record("create_bgp_router", asn);
        Ok(())
    }

    fn destroy_bgp_router(&mut self, asn: u32) -> RuntimeResult<()> {
        let count = self.router_mut(asn)?.neighbors.len();
        if count > 0 {
            return Err(RuntimeError::has_dependents(BGP_ROUTER, asn, count));
        }
        self.bgp.remove(&asn);
        self.record("destroy_bgp_router", asn);
        Ok(())
    }

    fn set_bgp_router_id(&mut self, asn: u32, router_id: Option<Ipv4Addr>) -> RuntimeResult<()> {
        self.router_mut(asn)?.router_id = router_id;
        self.record("set_bgp_router_id", asn);
        Ok(())
    }

    fn add_bgp_network(&mut self, asn: u32, network: Prefix) -> RuntimeResult<()> {
        self.router_mut(asn)?.networks.insert(network);
        self.record("add_bgp_network", format!("{asn}/{network}"));
        Ok(())
    }

    fn remove_bgp_network(&mut self, asn: u32, network: Prefix) -> RuntimeResult<()> {
        if !self.router_mut(asn)?.networks.remove(&network) {
            return Err(RuntimeError::not_found("bgp network", network));
        }
        self.record("remove_bgp_network", format!("{asn}/{network}"));
        Ok(())
    }

    fn set_bgp_redistribute(&mut self, asn: u32, sources: BTreeSet<String>) -> RuntimeResult<()> {
        self.router_mut(asn)?.redistribute = sources;
        self.record("set_bgp_redistribute", asn);
        Ok(())
    }

    fn set_bgp_maximum_paths(&mut self, asn: u32, paths: u32) -> RuntimeResult<()> {
        self.router_mut(asn)?.maximum_paths = paths;
        self.record("set_bgp_maximum_paths", asn);
        Ok(())
    }

    fn create_bgp_neighbor(
        &mut self,
        asn: u32,
        address: IpAddr,
        remote_as: u32,
    ) -> RuntimeResult<()> {
        let key = format!("{asn}/{address}");
        self.check_rejected(BGP_NEIGHBOR, &key)?;
        let router = self.router_mut(asn)?;
        if router.neighbors.contains_key(&address) {
            return Err(RuntimeError::already_exists(BGP_NEIGHBOR, key));
        }
        router.neighbors.insert(
            address,
            BgpNeighborState {
                address,
                remote_as,
                description: None,
                shutdown: false,
            },
        );
        self.record("create_bgp_neighbor", key);
        Ok(())
    }

    fn destroy_bgp_neighbor(&mut self, asn: u32, address: IpAddr) -> RuntimeResult<()> {
        let key = format!("{asn}/{address}");
        if self.router_mut(asn)?.neighbors.remove(&address).is_none() {
            return Err(RuntimeError::not_found(BGP_NEIGHBOR, key));
        }
        self.record("destroy_bgp_neighbor", key);
        Ok(())
    }

    fn set_bgp_neighbor_remote_as(
        &mut self,
        asn: u32,
        address: IpAddr,
        remote_as: u32,
    ) -> RuntimeResult<()> {
        self.neighbor_mut(asn, address)?.remote_as = remote_as;
        self.record("set_bgp_neighbor_remote_as", format!("{asn}/{address}"));
        Ok(())
    }

    fn set_bgp_neighbor_description(
        &mut self,
        asn: u32,
        address: IpAddr,
        description: Option<String>,
    ) -> RuntimeResult<()> {
        self.neighbor_mut(asn, address)?.description = description;
        self.record("set_bgp_neighbor_description", format!("{asn}/{address}"));
        Ok(())
    }

    fn set_bgp_neighbor_shutdown(
        &mut self,
        asn: u32,
        address: IpAddr,
        shutdown: bool,
    ) -> RuntimeResult<()> {
        self.neighbor_mut(asn, address)?.shutdown = shutdown;
        self.record("set_bgp_neighbor_shutdown", format!("{asn}/{address}"));
        Ok(())
    }
}

impl OspfRuntime for MemoryRuntime {
    fn ospf_router(&self, tag: &str) -> Option<&OspfRouterState> {
        self.ospf.get(tag)
    }

    fn ospf_routers(&self) -> Vec<String> {
        self.ospf.keys().cloned().collect()
    }

    fn create_ospf_router(&mut self, tag: &str) -> RuntimeResult<()> {
        self.check_rejected(OSPF_ROUTER, tag)?;
        if self.ospf.contains_key(tag) {
            return Err(RuntimeError::already_exists(OSPF_ROUTER, tag));
        }
        self.ospf.insert(
            tag.to_string(),
            OspfRouterState {
                instance_tag: tag.to_string(),
                router_id: None,
                redistribute: BTreeSet::new(),
                areas: BTreeMap::new(),
            },
        );
        self.record("create_ospf_router", tag);
        Ok(())
    }

    fn destroy_ospf_router(&mut self, tag: &str) -> RuntimeResult<()> {
        let count = self.ospf_mut(tag)?.areas.len();
        if count > 0 {
            return Err(RuntimeError::has_dependents(OSPF_ROUTER, tag, count));
        }
        self.ospf.remove(tag);
        self.record("destroy_ospf_router", tag);
        Ok(())
    }

    fn set_ospf_router_id(&mut self, tag: &str, router_id: Option<Ipv4Addr>) -> RuntimeResult<()> {
        self.ospf_mut(tag)?.router_id = router_id;
        self.record("set_ospf_router_id", tag);
        Ok(())
    }

    fn set_ospf_redistribute(&mut self, tag: &str, sources: BTreeSet<String>) -> RuntimeResult<()> {
        self.ospf_mut(tag)?.redistribute = sources;
        self.record("set_ospf_redistribute", tag);
        Ok(())
    }

    fn create_ospf_area(&mut self, tag: &str, area_id: Ipv4Addr) -> RuntimeResult<()> {
        let key = format!("{tag}/{area_id}");
        self.check_rejected(OSPF_AREA, &key)?;
        let router = self.ospf_mut(tag)?;
        if router.areas.contains_key(&area_id) {
            return Err(RuntimeError::already_exists(OSPF_AREA, key));
        }
        router.areas.insert(
            area_id,
            OspfAreaState {
                area_id,
                area_type: AreaType::default(),
                auth_type: AuthType::default(),
                interfaces: BTreeSet::new(),
            },
        );
        self.record("create_ospf_area", key);
        Ok(())
    }

    fn destroy_ospf_area(&mut self, tag: &str, area_id: Ipv4Addr) -> RuntimeResult<()> {
        let key = format!("{tag}/{area_id}");
        let count = self.area_mut(tag, area_id)?.interfaces.len();
        if count > 0 {
            return Err(RuntimeError::has_dependents(OSPF_AREA, key, count));
        }
        self.ospf_mut(tag)?.areas.remove(&area_id);
        self.record("destroy_ospf_area", key);
        Ok(())
    }

    fn set_ospf_area_type(
        &mut self,
        tag: &str,
        area_id: Ipv4Addr,
        area_type: AreaType,
    ) -> RuntimeResult<()> {
        self.area_mut(tag, area_id)?.area_type = area_type;
        self.record("set_ospf_area_type", format!("{tag}/{area_id}"));
        Ok(())
    }

    fn set_ospf_auth_type(
        &mut self,
        tag: &str,
        area_id: Ipv4Addr,
        auth_type: AuthType,
    ) -> RuntimeResult<()> {
        self.area_mut(tag, area_id)?.auth_type = auth_type;
        self.record("set_ospf_auth_type", format!("{tag}/{area_id}"));
        Ok(())
    }

    fn ospf_interface(&self, name: &str) -> Option<&OspfInterfaceState> {
        self.interfaces.get(name)
    }

    fn ospf_interfaces(&self) -> Vec<String> {
        self.interfaces.keys().cloned().collect()
    }

    fn create_ospf_interface(
        &mut self,
        name: &str,
        tag: &str,
        area_id: Ipv4Addr,
    ) -> RuntimeResult<()> {
        self.check_rejected(OSPF_INTERFACE, name)?;
        if self.interfaces.contains_key(name) {
            return Err(RuntimeError::already_exists(OSPF_INTERFACE, name));
        }
        self.area_mut(tag, area_id)?
            .interfaces
            .insert(name.to_string());
        self.interfaces.insert(
            name.to_string(),
            OspfInterfaceState::new(name, tag, area_id),
        );
        self.record("create_ospf_interface", name);
        Ok(())
    }

    fn destroy_ospf_interface(&mut self, name: &str) -> RuntimeResult<()> {
        let iface = self
            .interfaces
            .remove(name)
            .ok_or_else(|| RuntimeError::not_found(OSPF_INTERFACE, name))?;
        if let Ok(area) = self.area_mut(&iface.instance_tag, iface.area_id) {
            area.interfaces.remove(name);
        }
        self.record("destroy_ospf_interface", name);
        Ok(())
    }

    fn attach_ospf_interface(
        &mut self,
        name: &str,
        tag: &str,
        area_id: Ipv4Addr,
    ) -> RuntimeResult<()> {
        let (old_tag, old_area) = match self.interfaces.get(name) {
            Some(iface) => (iface.instance_tag.clone(), iface.area_id),
            None => return Err(RuntimeError::not_found(OSPF_INTERFACE, name)),
        };
        self.area_mut(tag, area_id)?
            .interfaces
            .insert(name.to_string());
        if (old_tag.as_str(), old_area) != (tag, area_id) {
            if let Ok(area) = self.area_mut(&old_tag, old_area) {
                area.interfaces.remove(name);
            }
        }
        if let Some(iface) = self.interfaces.get_mut(name) {
            iface.instance_tag = tag.to_string();
            iface.area_id = area_id;
        }
        self.record("attach_ospf_interface", name);
        Ok(())
    }

    fn set_ospf_interface_param(
        &mut self,
        name: &str,
        param: InterfaceParam,
    ) -> RuntimeResult<()> {
        self.interfaces
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(OSPF_INTERFACE, name))?
            .apply(param);
        self.record("set_ospf_interface_param", name);
        Ok(())
    }
}

impl RibRuntime for MemoryRuntime {
    fn static_route(&self, prefix: &Prefix) -> Option<&StaticRoute> {
        self.statics.get(prefix)
    }

    fn static_routes(&self) -> Vec<Prefix> {
        self.statics.keys().copied().collect()
    }

    fn install_static_route(&mut self, route: StaticRoute) -> RuntimeResult<()> {
        let prefix = route.prefix;
        self.check_rejected(STATIC_ROUTE, &prefix.to_string())?;
        if self.statics.contains_key(&prefix) {
            return Err(RuntimeError::already_exists(STATIC_ROUTE, prefix));
        }
        self.statics.insert(prefix, route);
        self.record("install_static_route", prefix);
        Ok(())
    }

    fn uninstall_static_route(&mut self, prefix: &Prefix) -> RuntimeResult<()> {
        if self.statics.remove(prefix).is_none() {
            return Err(RuntimeError::not_found(STATIC_ROUTE, prefix));
        }
        self.record("uninstall_static_route", prefix);
        Ok(())
    }

    fn set_static_nexthops(&mut self, prefix: &Prefix, nexthops: Vec<IpAddr>) -> RuntimeResult<()> {
        self.static_mut(prefix)?.nexthops = nexthops;
        self.record("set_static_nexthops", prefix);
        Ok(())
    }

    fn set_static_distance(&mut self, prefix: &Prefix, distance: u8) -> RuntimeResult<()> {
        self.static_mut(prefix)?.distance = distance;
        self.record("set_static_distance", prefix);
        Ok(())
    }

    fn set_static_metric(&mut self, prefix: &Prefix, metric: u32) -> RuntimeResult<()> {
        self.static_mut(prefix)?.metric = metric;
        self.record("set_static_metric", prefix);
        Ok(())
    }
}

impl ProtocolRuntime for MemoryRuntime {
    fn drain_events(&mut self) -> Vec<ProtocolEvent> {
        self.events.drain(..).collect()
    }

    fn dump(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
