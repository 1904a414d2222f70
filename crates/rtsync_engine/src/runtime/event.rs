//! Dynamic-state events emitted by the protocol runtime.

use crate::prefix::Prefix;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// BGP peer finite-state-machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BgpPeerState {
    /// Idle.
    Idle,
    /// Connect.
    Connect,
    /// Active.
    Active,
    /// OpenSent.
    OpenSent,
    /// OpenConfirm.
    OpenConfirm,
    /// Established.
    Established,
}

impl BgpPeerState {
    /// Name written to the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            BgpPeerState::Idle => "idle",
            BgpPeerState::Connect => "connect",
            BgpPeerState::Active => "active",
            BgpPeerState::OpenSent => "open_sent",
            BgpPeerState::OpenConfirm => "open_confirm",
            BgpPeerState::Established => "established",
        }
    }
}

impl fmt::Display for BgpPeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A BGP path as published to `BGP_Route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpRouteInfo {
    /// Destination.
    pub prefix: Prefix,
    /// Peer the path was learned from.
    pub peer: IpAddr,
    /// Path metric.
    pub metric: u32,
    /// Best-path flag.
    pub selected: bool,
    /// Opaque path attributes.
    pub path_attributes: BTreeMap<String, String>,
}

/// An OSPF neighbor as published to `OSPF_Neighbor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OspfNeighborInfo {
    /// Neighbor router id.
    pub router_id: Ipv4Addr,
    /// Neighbor interface address.
    pub if_addr: Ipv4Addr,
    /// FSM state.
    pub state: String,
    /// DR election priority.
    pub priority: u8,
}

/// LSA type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LsaType {
    /// Router LSA.
    Router,
    /// Network LSA.
    Network,
}

impl LsaType {
    /// Name written to the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LsaType::Router => "router",
            LsaType::Network => "network",
        }
    }

    /// Parses the store name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "router" => Some(LsaType::Router),
            "network" => Some(LsaType::Network),
            _ => None,
        }
    }
}

/// Identity of an LSA within an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LsaKey {
    /// LSA type.
    pub lsa_type: LsaType,
    /// Link-state id.
    pub ls_id: Ipv4Addr,
    /// Advertising router.
    pub adv_router: Ipv4Addr,
}

/// An LSA as published to `OSPF_LSA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LsaInfo {
    /// Identity.
    pub key: LsaKey,
    /// LS sequence number.
    pub seq_num: u32,
    /// Fletcher checksum.
    pub checksum: u16,
}

/// An SPF result route as published to `OSPF_Route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OspfRouteInfo {
    /// Destination.
    pub prefix: Prefix,
    /// `intra_area`, `inter_area` or `external`.
    pub path_type: String,
    /// Path cost.
    pub cost: u32,
    /// Nexthops.
    pub nexthops: Vec<IpAddr>,
}

/// A change of dynamic protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// A path was learned or refreshed.
    BgpRouteAdded {
        /// Router ASN.
        asn: u32,
        /// The path.
        route: BgpRouteInfo,
    },
    /// Best-path selection changed for a route.
    BgpRouteSelected {
        /// Router ASN.
        asn: u32,
        /// Destination.
        prefix: Prefix,
        /// New flag.
        selected: bool,
    },
    /// A selected route is announced to the RIB.
    BgpRouteAnnounced {
        /// Router ASN.
        asn: u32,
        /// Destination.
        prefix: Prefix,
    },
    /// A no longer selected route is withdrawn from the RIB.
    BgpRouteWithdrawn {
        /// Router ASN.
        asn: u32,
        /// Destination.
        prefix: Prefix,
    },
    /// A path disappeared.
    BgpRouteDeleted {
        /// Router ASN.
        asn: u32,
        /// Destination.
        prefix: Prefix,
    },
    /// A peer FSM transition.
    BgpNeighborStateChanged {
        /// Router ASN.
        asn: u32,
        /// Neighbor address.
        neighbor: IpAddr,
        /// New state.
        state: BgpPeerState,
    },
    /// An interface FSM transition.
    OspfInterfaceStateChanged {
        /// Interface name.
        interface: String,
        /// New state.
        state: String,
    },
    /// A neighbor was discovered or changed state.
    OspfNeighborStateChanged {
        /// Interface name.
        interface: String,
        /// Neighbor.
        neighbor: OspfNeighborInfo,
    },
    /// A neighbor went away.
    OspfNeighborRemoved {
        /// Interface name.
        interface: String,
        /// Neighbor router id.
        router_id: Ipv4Addr,
    },
    /// An LSA was installed or refreshed.
    OspfLsaAdded {
        /// Instance tag.
        instance_tag: String,
        /// Area id.
        area_id: Ipv4Addr,
        /// The LSA.
        lsa: LsaInfo,
    },
    /// An LSA was flushed.
    OspfLsaRemoved {
        /// Instance tag.
        instance_tag: String,
        /// Area id.
        area_id: Ipv4Addr,
        /// The LSA.
        key: LsaKey,
    },
    /// An SPF run produced a new route table for an area.
    OspfSpfCompleted {
        /// Instance tag.
        instance_tag: String,
        /// Area id.
        area_id: Ipv4Addr,
        /// The complete new route table.
        routes: Vec<OspfRouteInfo>,
    },
    /// FIB selection changed for a RIB route.
    RibRouteSelected {
        /// Destination.
        prefix: Prefix,
        /// Originating protocol.
        from: String,
        /// New flag.
        selected: bool,
    },
}

impl ProtocolEvent {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::BgpRouteAdded { .. } => "bgp_route_added",
            ProtocolEvent::BgpRouteSelected { .. } => "bgp_route_selected",
            ProtocolEvent::BgpRouteAnnounced { .. } => "bgp_route_announced",
            ProtocolEvent::BgpRouteWithdrawn { .. } => "bgp_route_withdrawn",
            ProtocolEvent::BgpRouteDeleted { .. } => "bgp_route_deleted",
            ProtocolEvent::BgpNeighborStateChanged { .. } => "bgp_neighbor_state_changed",
            ProtocolEvent::OspfInterfaceStateChanged { .. } => "ospf_interface_state_changed",
            ProtocolEvent::OspfNeighborStateChanged { .. } => "ospf_neighbor_state_changed",
            ProtocolEvent::OspfNeighborRemoved { .. } => "ospf_neighbor_removed",
            ProtocolEvent::OspfLsaAdded { .. } => "ospf_lsa_added",
            ProtocolEvent::OspfLsaRemoved { .. } => "ospf_lsa_removed",
            ProtocolEvent::OspfSpfCompleted { .. } => "ospf_spf_completed",
            ProtocolEvent::RibRouteSelected { .. } => "rib_route_selected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tag() {
        let event = ProtocolEvent::BgpRouteWithdrawn {
            asn: 65001,
            prefix: "10.0.0.0/8".parse().unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "bgp_route_withdrawn");
        assert_eq!(json["prefix"], "10.0.0.0/8");
        assert_eq!(event.name(), "bgp_route_withdrawn");
    }

    #[test]
    fn lsa_type_names() {
        assert_eq!(LsaType::from_name("network"), Some(LsaType::Network));
        assert_eq!(LsaType::Router.as_str(), "router");
        assert_eq!(LsaType::from_name("summary"), None);
    }
}
