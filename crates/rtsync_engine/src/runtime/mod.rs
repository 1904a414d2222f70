//! The protocol runtime contract.
//!
//! The runtime owns the live protocol instances (routers, areas,
//! interfaces, neighbors, static routes). The engine drives it through
//! lookup, create, destroy and per-field setter calls keyed by the
//! declared key of each configuration row, and drains the dynamic-state
//! events it emits.

mod event;
mod memory;

pub use event::{
    BgpPeerState, BgpRouteInfo, LsaInfo, LsaKey, LsaType, OspfNeighborInfo, OspfRouteInfo,
    ProtocolEvent,
};
pub use memory::{MemoryRuntime, RuntimeOp};

use crate::prefix::Prefix;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Result type for runtime calls.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors reported by the protocol runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// No instance with this key.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Instance kind.
        kind: &'static str,
        /// Instance key.
        key: String,
    },

    /// An instance with this key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Instance kind.
        kind: &'static str,
        /// Instance key.
        key: String,
    },

    /// The instance still has dependent children.
    #[error("{kind} {key} still has {count} dependents")]
    HasDependents {
        /// Instance kind.
        kind: &'static str,
        /// Instance key.
        key: String,
        /// Number of remaining children.
        count: usize,
    },

    /// The runtime refused the operation.
    #[error("{kind} {key} rejected: {reason}")]
    Rejected {
        /// Instance kind.
        kind: &'static str,
        /// Instance key.
        key: String,
        /// Why.
        reason: String,
    },
}

impl RuntimeError {
    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(kind: &'static str, key: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Creates a has-dependents error.
    pub fn has_dependents(kind: &'static str, key: impl fmt::Display, count: usize) -> Self {
        Self::HasDependents {
            kind,
            key: key.to_string(),
            count,
        }
    }

    /// Creates a rejection.
    pub fn rejected(kind: &'static str, key: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// True for [`RuntimeError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// A live BGP router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpRouterState {
    /// Autonomous-system number.
    pub asn: u32,
    /// Router identifier.
    pub router_id: Option<Ipv4Addr>,
    /// Statically announced networks.
    pub networks: BTreeSet<Prefix>,
    /// Redistributed sources.
    pub redistribute: BTreeSet<String>,
    /// ECMP path limit.
    pub maximum_paths: u32,
    /// Neighbors by address.
    pub neighbors: BTreeMap<IpAddr, BgpNeighborState>,
}

/// A live BGP neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpNeighborState {
    /// Neighbor address.
    pub address: IpAddr,
    /// Remote autonomous-system number.
    pub remote_as: u32,
    /// Description.
    pub description: Option<String>,
    /// Administratively shut down.
    pub shutdown: bool,
}

/// OSPF area type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaType {
    /// Regular area.
    #[default]
    Default,
    /// Stub area.
    Stub,
    /// Not-so-stubby area.
    Nssa,
}

impl FromStr for AreaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(AreaType::Default),
            "stub" => Ok(AreaType::Stub),
            "nssa" => Ok(AreaType::Nssa),
            other => Err(format!("unknown area type '{other}'")),
        }
    }
}

/// OSPF area authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// No authentication.
    #[default]
    None,
    /// Simple password.
    Text,
    /// MD5 digest.
    Md5,
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthType::None),
            "text" => Ok(AuthType::Text),
            "md5" => Ok(AuthType::Md5),
            other => Err(format!("unknown auth type '{other}'")),
        }
    }
}

/// A live OSPF router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OspfRouterState {
    /// Instance tag.
    pub instance_tag: String,
    /// Router identifier.
    pub router_id: Option<Ipv4Addr>,
    /// Redistributed sources.
    pub redistribute: BTreeSet<String>,
    /// Areas by id.
    pub areas: BTreeMap<Ipv4Addr, OspfAreaState>,
}

/// A live OSPF area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OspfAreaState {
    /// Area id.
    pub area_id: Ipv4Addr,
    /// Area type.
    pub area_type: AreaType,
    /// Authentication.
    pub auth_type: AuthType,
    /// Names of the attached interfaces.
    pub interfaces: BTreeSet<String>,
}

/// A tunable OSPF interface parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceParam {
    /// Hello interval in seconds.
    HelloInterval(u32),
    /// Dead interval in seconds.
    DeadInterval(u32),
    /// Output cost.
    Cost(u32),
    /// DR election priority.
    Priority(u8),
    /// Passive flag.
    Passive(bool),
}

/// A live OSPF interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OspfInterfaceState {
    /// Interface name.
    pub name: String,
    /// Owning instance.
    pub instance_tag: String,
    /// Attached area.
    pub area_id: Ipv4Addr,
    /// Hello interval in seconds.
    pub hello_interval: u32,
    /// Dead interval in seconds.
    pub dead_interval: u32,
    /// Output cost.
    pub cost: u32,
    /// DR election priority.
    pub priority: u8,
    /// Passive flag.
    pub passive: bool,
}

impl OspfInterfaceState {
    /// Creates an interface with protocol default parameters.
    pub fn new(
        name: impl Into<String>,
        instance_tag: impl Into<String>,
        area_id: Ipv4Addr,
    ) -> Self {
        Self {
            name: name.into(),
            instance_tag: instance_tag.into(),
            area_id,
            hello_interval: 10,
            dead_interval: 40,
            cost: 10,
            priority: 1,
            passive: false,
        }
    }

    /// Applies one parameter.
    pub fn apply(&mut self, param: InterfaceParam) {
        match param {
            InterfaceParam::HelloInterval(v) => self.hello_interval = v,
            InterfaceParam::DeadInterval(v) => self.dead_interval = v,
            InterfaceParam::Cost(v) => self.cost = v,
            InterfaceParam::Priority(v) => self.priority = v,
            InterfaceParam::Passive(v) => self.passive = v,
        }
    }
}

/// A configured static route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticRoute {
    /// Destination.
    pub prefix: Prefix,
    /// Nexthop addresses.
    pub nexthops: Vec<IpAddr>,
    /// Administrative distance.
    pub distance: u8,
    /// Metric.
    pub metric: u32,
}

/// BGP operations.
pub trait BgpRuntime {
    /// Looks up a router.
    fn bgp_router(&self, asn: u32) -> Option<&BgpRouterState>;
    /// ASNs of all routers.
    fn bgp_routers(&self) -> Vec<u32>;
    /// Creates a router with default settings.
    fn create_bgp_router(&mut self, asn: u32) -> RuntimeResult<()>;
    /// Destroys a router; fails while neighbors remain.
    fn destroy_bgp_router(&mut self, asn: u32) -> RuntimeResult<()>;
    /// Sets or clears the router id.
    fn set_bgp_router_id(&mut self, asn: u32, router_id: Option<Ipv4Addr>) -> RuntimeResult<()>;
    /// Starts announcing a network.
    fn add_bgp_network(&mut self, asn: u32, network: Prefix) -> RuntimeResult<()>;
    /// Stops announcing a network.
    fn remove_bgp_network(&mut self, asn: u32, network: Prefix) -> RuntimeResult<()>;
    /// Replaces the redistributed sources.
    fn set_bgp_redistribute(&mut self, asn: u32, sources: BTreeSet<String>) -> RuntimeResult<()>;
    /// Sets the ECMP path limit.
    fn set_bgp_maximum_paths(&mut self, asn: u32, paths: u32) -> RuntimeResult<()>;
    /// Creates a neighbor under a router.
    fn create_bgp_neighbor(&mut self, asn: u32, address: IpAddr, remote_as: u32)
        -> RuntimeResult<()>;
    /// Destroys a neighbor.
    fn destroy_bgp_neighbor(&mut self, asn: u32, address: IpAddr) -> RuntimeResult<()>;
    /// Sets the remote AS of a neighbor.
    fn set_bgp_neighbor_remote_as(
        &mut self,
        asn: u32,
        address: IpAddr,
        remote_as: u32,
    ) -> RuntimeResult<()>;
    /// Sets or clears a neighbor description.
    fn set_bgp_neighbor_description(
        &mut self,
        asn: u32,
        address: IpAddr,
        description: Option<String>,
    ) -> RuntimeResult<()>;
    /// Shuts a neighbor down or brings it back.
    fn set_bgp_neighbor_shutdown(
        &mut self,
        asn: u32,
        address: IpAddr,
        shutdown: bool,
    ) -> RuntimeResult<()>;
}

/// OSPF operations.
pub trait OspfRuntime {
    /// Looks up a router.
    fn ospf_router(&self, tag: &str) -> Option<&OspfRouterState>;
    /// Tags of all routers.
    fn ospf_routers(&self) -> Vec<String>;
    /// Creates a router.
    fn create_ospf_router(&mut self, tag: &str) -> RuntimeResult<()>;
    /// Destroys a router; fails while areas remain.
    fn destroy_ospf_router(&mut self, tag: &str) -> RuntimeResult<()>;
    /// Sets or clears the router id.
    fn set_ospf_router_id(&mut self, tag: &str, router_id: Option<Ipv4Addr>) -> RuntimeResult<()>;
    /// Replaces the redistributed sources.
    fn set_ospf_redistribute(&mut self, tag: &str, sources: BTreeSet<String>) -> RuntimeResult<()>;
    /// Creates an area under a router.
    fn create_ospf_area(&mut self, tag: &str, area_id: Ipv4Addr) -> RuntimeResult<()>;
    /// Destroys an area; fails while interfaces are attached.
    fn destroy_ospf_area(&mut self, tag: &str, area_id: Ipv4Addr) -> RuntimeResult<()>;
    /// Sets the area type.
    fn set_ospf_area_type(
        &mut self,
        tag: &str,
        area_id: Ipv4Addr,
        area_type: AreaType,
    ) -> RuntimeResult<()>;
    /// Sets the area authentication.
    fn set_ospf_auth_type(
        &mut self,
        tag: &str,
        area_id: Ipv4Addr,
        auth_type: AuthType,
    ) -> RuntimeResult<()>;
    /// Looks up an interface.
    fn ospf_interface(&self, name: &str) -> Option<&OspfInterfaceState>;
    /// Names of all interfaces.
    fn ospf_interfaces(&self) -> Vec<String>;
    /// Creates an interface attached to an existing area.
    fn create_ospf_interface(&mut self, name: &str, tag: &str, area_id: Ipv4Addr)
        -> RuntimeResult<()>;
    /// Destroys an interface.
    fn destroy_ospf_interface(&mut self, name: &str) -> RuntimeResult<()>;
    /// Moves an interface to another area.
    fn attach_ospf_interface(&mut self, name: &str, tag: &str, area_id: Ipv4Addr)
        -> RuntimeResult<()>;
    /// Sets one interface parameter.
    fn set_ospf_interface_param(&mut self, name: &str, param: InterfaceParam)
        -> RuntimeResult<()>;
}

/// RIB (static route) operations.
pub trait RibRuntime {
    /// Looks up a static route.
    fn static_route(&self, prefix: &Prefix) -> Option<&StaticRoute>;
    /// Prefixes of all static routes.
    fn static_routes(&self) -> Vec<Prefix>;
    /// Installs a static route.
    fn install_static_route(&mut self, route: StaticRoute) -> RuntimeResult<()>;
    /// Removes a static route.
    fn uninstall_static_route(&mut self, prefix: &Prefix) -> RuntimeResult<()>;
    /// Replaces the nexthops of a static route.
    fn set_static_nexthops(&mut self, prefix: &Prefix, nexthops: Vec<IpAddr>) -> RuntimeResult<()>;
    /// Sets the administrative distance of a static route.
    fn set_static_distance(&mut self, prefix: &Prefix, distance: u8) -> RuntimeResult<()>;
    /// Sets the metric of a static route.
    fn set_static_metric(&mut self, prefix: &Prefix, metric: u32) -> RuntimeResult<()>;
}

/// The complete protocol runtime.
pub trait ProtocolRuntime: BgpRuntime + OspfRuntime + RibRuntime {
    /// Takes the dynamic-state events emitted since the last call.
    fn drain_events(&mut self) -> Vec<ProtocolEvent>;

    /// Best-effort JSON view of the live state, for introspection.
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}
