//! Table names and column names of the routing schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A table in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Singleton system row carrying the `cur_cfg` marker.
    #[serde(rename = "System")]
    System,
    /// BGP router instances keyed by ASN.
    #[serde(rename = "BGP_Router")]
    BgpRouter,
    /// BGP neighbors owned by a router.
    #[serde(rename = "BGP_Neighbor")]
    BgpNeighbor,
    /// BGP routes published by the protocol runtime.
    #[serde(rename = "BGP_Route")]
    BgpRoute,
    /// OSPF router instances keyed by instance tag.
    #[serde(rename = "OSPF_Router")]
    OspfRouter,
    /// OSPF areas referenced from a router's area map.
    #[serde(rename = "OSPF_Area")]
    OspfArea,
    /// OSPF-enabled interfaces.
    #[serde(rename = "OSPF_Interface")]
    OspfInterface,
    /// OSPF neighbors discovered on an interface.
    #[serde(rename = "OSPF_Neighbor")]
    OspfNeighbor,
    /// Link-state advertisements of an area.
    #[serde(rename = "OSPF_LSA")]
    OspfLsa,
    /// Routes computed by the last SPF run of an area.
    #[serde(rename = "OSPF_Route")]
    OspfRoute,
    /// RIB routes; rows from `static` are configuration.
    #[serde(rename = "Route")]
    Route,
}

impl Table {
    /// All tables, in schema order.
    pub const ALL: [Table; 11] = [
        Table::System,
        Table::BgpRouter,
        Table::BgpNeighbor,
        Table::BgpRoute,
        Table::OspfRouter,
        Table::OspfArea,
        Table::OspfInterface,
        Table::OspfNeighbor,
        Table::OspfLsa,
        Table::OspfRoute,
        Table::Route,
    ];

    /// Returns the schema name of the table.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Table::System => "System",
            Table::BgpRouter => "BGP_Router",
            Table::BgpNeighbor => "BGP_Neighbor",
            Table::BgpRoute => "BGP_Route",
            Table::OspfRouter => "OSPF_Router",
            Table::OspfArea => "OSPF_Area",
            Table::OspfInterface => "OSPF_Interface",
            Table::OspfNeighbor => "OSPF_Neighbor",
            Table::OspfLsa => "OSPF_LSA",
            Table::OspfRoute => "OSPF_Route",
            Table::Route => "Route",
        }
    }

    /// Returns true if rows of this table are only ever written by the
    /// state publisher.
    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Table::BgpRoute
                | Table::OspfNeighbor
                | Table::OspfLsa
                | Table::OspfRoute
        )
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown table '{s}'"))
    }
}

/// Column names, grouped by table.
pub mod columns {
    /// `System` columns.
    pub mod system {
        /// Configuration generation; greater than zero once configured.
        pub const CUR_CFG: &str = "cur_cfg";
    }

    /// `BGP_Router` columns.
    pub mod bgp_router {
        /// Autonomous-system number (key).
        pub const ASN: &str = "asn";
        /// Router identifier (IPv4 text).
        pub const ROUTER_ID: &str = "router_id";
        /// Statically announced networks (list of prefixes).
        pub const NETWORKS: &str = "networks";
        /// Redistributed route sources (list of text).
        pub const REDISTRIBUTE: &str = "redistribute";
        /// ECMP path limit.
        pub const MAXIMUM_PATHS: &str = "maximum_paths";
    }

    /// `BGP_Neighbor` columns.
    pub mod bgp_neighbor {
        /// Reference to the owning `BGP_Router` row.
        pub const BGP_ROUTER: &str = "bgp_router";
        /// Neighbor address (key within the router).
        pub const IP_ADDRESS: &str = "ip_address";
        /// Remote autonomous-system number.
        pub const REMOTE_AS: &str = "remote_as";
        /// Free-form description.
        pub const DESCRIPTION: &str = "description";
        /// Administrative shutdown.
        pub const SHUTDOWN: &str = "shutdown";
        /// Status map (`bgp_peer_state`).
        pub const STATUS: &str = "status";
        /// Statistics map (`established_count`).
        pub const STATISTICS: &str = "statistics";
        /// Status key carrying the peer FSM state.
        pub const STATUS_PEER_STATE: &str = "bgp_peer_state";
        /// Statistics key counting transitions into `established`.
        pub const STAT_ESTABLISHED_COUNT: &str = "established_count";
    }

    /// `BGP_Route` columns.
    pub mod bgp_route {
        /// Reference to the owning `BGP_Router` row.
        pub const BGP_ROUTER: &str = "bgp_router";
        /// Destination prefix.
        pub const PREFIX: &str = "prefix";
        /// Peer the path was learned from.
        pub const PEER: &str = "peer";
        /// Path metric.
        pub const METRIC: &str = "metric";
        /// Best-path flag owned by the protocol.
        pub const SELECTED: &str = "selected";
        /// `announce`, `withdraw` or empty.
        pub const RIB_STATE: &str = "rib_state";
        /// Opaque path attributes.
        pub const PATH_ATTRIBUTES: &str = "path_attributes";
    }

    /// `OSPF_Router` columns.
    pub mod ospf_router {
        /// Instance tag (key).
        pub const INSTANCE_TAG: &str = "instance_tag";
        /// Router identifier (IPv4 text).
        pub const ROUTER_ID: &str = "router_id";
        /// Map of area id to `OSPF_Area` row.
        pub const AREAS: &str = "areas";
        /// Redistributed route sources.
        pub const REDISTRIBUTE: &str = "redistribute";
    }

    /// `OSPF_Area` columns.
    pub mod ospf_area {
        /// Area identifier in dotted-quad form (key).
        pub const AREA_ID: &str = "area_id";
        /// `default`, `stub` or `nssa`.
        pub const AREA_TYPE: &str = "area_type";
        /// `none`, `text` or `md5`.
        pub const AUTH_TYPE: &str = "auth_type";
        /// Routes of the last SPF run (list of refs).
        pub const OSPF_ROUTES: &str = "ospf_routes";
        /// Router LSAs (list of refs).
        pub const ROUTER_LSAS: &str = "router_lsas";
        /// Network LSAs (list of refs).
        pub const NETWORK_LSAS: &str = "network_lsas";
        /// Wrapping sum of all LSA checksums in the area.
        pub const LSA_CHECKSUM_SUM: &str = "lsa_checksum_sum";
        /// Number of completed SPF runs.
        pub const SPF_CALC_COUNT: &str = "spf_calc_count";
    }

    /// `OSPF_Interface` columns.
    pub mod ospf_interface {
        /// Interface name (key).
        pub const NAME: &str = "name";
        /// Owning OSPF instance tag.
        pub const INSTANCE_TAG: &str = "instance_tag";
        /// Area the interface is attached to.
        pub const AREA_ID: &str = "area_id";
        /// Hello interval in seconds.
        pub const HELLO_INTERVAL: &str = "hello_interval";
        /// Dead interval in seconds.
        pub const DEAD_INTERVAL: &str = "dead_interval";
        /// Interface cost.
        pub const COST: &str = "cost";
        /// Router priority for DR election.
        pub const PRIORITY: &str = "priority";
        /// Passive interface flag.
        pub const PASSIVE: &str = "passive";
        /// Interface state machine state.
        pub const STATE: &str = "state";
        /// Neighbors discovered on the interface (list of refs).
        pub const NEIGHBORS: &str = "neighbors";
    }

    /// `OSPF_Neighbor` columns.
    pub mod ospf_neighbor {
        /// Interface the neighbor was seen on.
        pub const INTERFACE: &str = "interface";
        /// Neighbor router id.
        pub const NBR_ROUTER_ID: &str = "nbr_router_id";
        /// Neighbor interface address.
        pub const NBR_IF_ADDR: &str = "nbr_if_addr";
        /// Neighbor FSM state.
        pub const STATE: &str = "state";
        /// Neighbor priority.
        pub const PRIORITY: &str = "priority";
    }

    /// `OSPF_LSA` columns.
    pub mod ospf_lsa {
        /// Owning OSPF instance tag.
        pub const INSTANCE_TAG: &str = "instance_tag";
        /// Owning area.
        pub const AREA_ID: &str = "area_id";
        /// `router` or `network`.
        pub const LSA_TYPE: &str = "lsa_type";
        /// Link-state id.
        pub const LS_ID: &str = "ls_id";
        /// Advertising router.
        pub const ADV_ROUTER: &str = "adv_router";
        /// LS sequence number.
        pub const LS_SEQ_NUM: &str = "ls_seq_num";
        /// LSA checksum.
        pub const CHKSUM: &str = "chksum";
    }

    /// `OSPF_Route` columns.
    pub mod ospf_route {
        /// Destination prefix.
        pub const PREFIX: &str = "prefix";
        /// `intra_area`, `inter_area` or `external`.
        pub const PATH_TYPE: &str = "path_type";
        /// Path cost.
        pub const COST: &str = "cost";
        /// Nexthop addresses.
        pub const NEXTHOPS: &str = "nexthops";
    }

    /// `Route` columns.
    pub mod route {
        /// Destination prefix.
        pub const PREFIX: &str = "prefix";
        /// Originating protocol (`static`, `bgp`, `ospf`, `connected`).
        pub const FROM: &str = "from";
        /// Nexthop addresses.
        pub const NEXTHOPS: &str = "nexthops";
        /// Administrative distance.
        pub const DISTANCE: &str = "distance";
        /// Route metric.
        pub const METRIC: &str = "metric";
        /// FIB selection flag.
        pub const SELECTED: &str = "selected";
        /// The `from` value of configuration rows.
        pub const FROM_STATIC: &str = "static";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(table.name().parse::<Table>().unwrap(), table);
        }
        assert!("Nope".parse::<Table>().is_err());
    }

    #[test]
    fn dynamic_tables() {
        assert!(Table::BgpRoute.is_dynamic());
        assert!(Table::OspfLsa.is_dynamic());
        assert!(!Table::BgpRouter.is_dynamic());
        assert!(!Table::Route.is_dynamic());
    }
}
