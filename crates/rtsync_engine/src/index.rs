//! Per-snapshot lookup tables keyed by declared row keys.
//!
//! Built once per refresh and shared read-only by every reconciler and
//! the publisher, so lookups by key never scan a table.

use crate::fields;
use crate::prefix::Prefix;
use crate::runtime::{LsaKey, LsaType};
use rtsync_store::columns::{
    bgp_neighbor, bgp_route, bgp_router, ospf_interface, ospf_lsa, ospf_neighbor, ospf_router,
    route, system,
};
use rtsync_store::{Row, RowId, SequenceNumber, Snapshot, Table};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

/// Lookup tables over one snapshot.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    seq: SequenceNumber,
    system: Option<Arc<Row>>,
    bgp_routers: HashMap<u32, Arc<Row>>,
    bgp_router_asns: HashMap<RowId, u32>,
    bgp_neighbors: HashMap<(u32, IpAddr), Arc<Row>>,
    bgp_routes: HashMap<(u32, Prefix), Arc<Row>>,
    ospf_routers: HashMap<String, Arc<Row>>,
    ospf_areas: HashMap<(String, Ipv4Addr), Arc<Row>>,
    area_owners: HashMap<RowId, (String, Ipv4Addr)>,
    ospf_interfaces: HashMap<String, Arc<Row>>,
    ospf_neighbors: HashMap<(String, Ipv4Addr), Arc<Row>>,
    ospf_lsas: HashMap<(String, Ipv4Addr, LsaKey), Arc<Row>>,
    routes: HashMap<(Prefix, String), Arc<Row>>,
    static_routes: HashMap<Prefix, Arc<Row>>,
}

impl SnapshotIndex {
    /// Indexes every row of `snapshot` whose key columns parse. Rows with
    /// unparsable keys are left out; reconcilers report them as row
    /// failures when they touch them.
    #[must_use]
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut index = Self {
            seq: snapshot.seq(),
            system: snapshot.rows(Table::System).next().cloned(),
            ..Self::default()
        };

        for row in snapshot.rows(Table::BgpRouter) {
            if let Ok(asn) = fields::u32_value(row, bgp_router::ASN) {
                index.bgp_router_asns.insert(row.id(), asn);
                index.bgp_routers.insert(asn, Arc::clone(row));
            }
        }
        for row in snapshot.rows(Table::BgpNeighbor) {
            let key = row
                .reference(bgp_neighbor::BGP_ROUTER)
                .and_then(|r| index.bgp_router_asns.get(&r).copied())
                .zip(fields::ip(row, bgp_neighbor::IP_ADDRESS).ok());
            match key {
                Some(key) => {
                    index.bgp_neighbors.insert(key, Arc::clone(row));
                }
                None => debug!(row = %row.id(), "unindexed BGP neighbor"),
            }
        }
        for row in snapshot.rows(Table::BgpRoute) {
            let key = row
                .reference(bgp_route::BGP_ROUTER)
                .and_then(|r| index.bgp_router_asns.get(&r).copied())
                .zip(fields::prefix(row, bgp_route::PREFIX).ok());
            if let Some(key) = key {
                index.bgp_routes.insert(key, Arc::clone(row));
            }
        }

        for row in snapshot.rows(Table::OspfRouter) {
            let Ok(tag) = fields::text(row, ospf_router::INSTANCE_TAG) else {
                debug!(row = %row.id(), "unindexed OSPF router");
                continue;
            };
            let tag = tag.to_string();
            if let Ok(areas) = fields::area_map(row, ospf_router::AREAS) {
                for (area_id, area_row) in areas {
                    if let Some(area) = snapshot.get(Table::OspfArea, area_row) {
                        index
                            .ospf_areas
                            .insert((tag.clone(), area_id), Arc::clone(area));
                        index.area_owners.insert(area_row, (tag.clone(), area_id));
                    }
                }
            }
            index.ospf_routers.insert(tag, Arc::clone(row));
        }
        for row in snapshot.rows(Table::OspfInterface) {
            if let Ok(name) = fields::text(row, ospf_interface::NAME) {
                index
                    .ospf_interfaces
                    .insert(name.to_string(), Arc::clone(row));
            }
        }
        for row in snapshot.rows(Table::OspfNeighbor) {
            let iface = fields::text(row, ospf_neighbor::INTERFACE).ok();
            let rid = fields::ipv4(row, ospf_neighbor::NBR_ROUTER_ID).ok();
            if let (Some(iface), Some(rid)) = (iface, rid) {
                index
                    .ospf_neighbors
                    .insert((iface.to_string(), rid), Arc::clone(row));
            }
        }
        for row in snapshot.rows(Table::OspfLsa) {
            if let Some(key) = lsa_row_key(row) {
                index.ospf_lsas.insert(key, Arc::clone(row));
            }
        }

        for row in snapshot.rows(Table::Route) {
            let Ok(prefix) = fields::prefix(row, route::PREFIX) else {
                continue;
            };
            let from = row.text(route::FROM).unwrap_or_default().to_string();
            if from == route::FROM_STATIC {
                index.static_routes.insert(prefix, Arc::clone(row));
            }
            index.routes.insert((prefix, from), Arc::clone(row));
        }

        index
    }

    /// Sequence number of the indexed snapshot.
    #[must_use]
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// The system row, if any.
    #[must_use]
    pub fn system(&self) -> Option<&Arc<Row>> {
        self.system.as_ref()
    }

    /// The configuration generation counter; 0 when unset.
    #[must_use]
    pub fn cur_cfg(&self) -> i64 {
        self.system
            .as_ref()
            .and_then(|r| r.integer(system::CUR_CFG))
            .unwrap_or(0)
    }

    /// BGP router row by ASN.
    #[must_use]
    pub fn bgp_router(&self, asn: u32) -> Option<&Arc<Row>> {
        self.bgp_routers.get(&asn)
    }

    /// ASN of a live BGP router row.
    #[must_use]
    pub fn bgp_router_asn(&self, id: RowId) -> Option<u32> {
        self.bgp_router_asns.get(&id).copied()
    }

    /// BGP neighbor row by router ASN and address.
    #[must_use]
    pub fn bgp_neighbor(&self, asn: u32, address: IpAddr) -> Option<&Arc<Row>> {
        self.bgp_neighbors.get(&(asn, address))
    }

    /// BGP route row by router ASN and prefix.
    #[must_use]
    pub fn bgp_route(&self, asn: u32, prefix: Prefix) -> Option<&Arc<Row>> {
        self.bgp_routes.get(&(asn, prefix))
    }

    /// OSPF router row by instance tag.
    #[must_use]
    pub fn ospf_router(&self, tag: &str) -> Option<&Arc<Row>> {
        self.ospf_routers.get(tag)
    }

    /// OSPF area row referenced by a router under `area_id`.
    #[must_use]
    pub fn ospf_area(&self, tag: &str, area_id: Ipv4Addr) -> Option<&Arc<Row>> {
        self.ospf_areas.get(&(tag.to_string(), area_id))
    }

    /// The router tag and map key an area row is referenced under.
    #[must_use]
    pub fn area_owner(&self, id: RowId) -> Option<&(String, Ipv4Addr)> {
        self.area_owners.get(&id)
    }

    /// OSPF interface row by name.
    #[must_use]
    pub fn ospf_interface(&self, name: &str) -> Option<&Arc<Row>> {
        self.ospf_interfaces.get(name)
    }

    /// OSPF neighbor row by interface name and neighbor router id.
    #[must_use]
    pub fn ospf_neighbor(&self, interface: &str, router_id: Ipv4Addr) -> Option<&Arc<Row>> {
        self.ospf_neighbors.get(&(interface.to_string(), router_id))
    }

    /// LSA row by area and LSA key.
    #[must_use]
    pub fn ospf_lsa(&self, tag: &str, area_id: Ipv4Addr, key: &LsaKey) -> Option<&Arc<Row>> {
        self.ospf_lsas.get(&(tag.to_string(), area_id, *key))
    }

    /// Route row by prefix and originating protocol.
    #[must_use]
    pub fn route(&self, prefix: Prefix, from: &str) -> Option<&Arc<Row>> {
        self.routes.get(&(prefix, from.to_string()))
    }

    /// Static route row by prefix.
    #[must_use]
    pub fn static_route(&self, prefix: Prefix) -> Option<&Arc<Row>> {
        self.static_routes.get(&prefix)
    }

    /// Number of static route rows.
    #[must_use]
    pub fn static_route_count(&self) -> usize {
        self.static_routes.len()
    }
}

/// Decodes the key columns of an LSA row.
pub(crate) fn lsa_row_key(row: &Row) -> Option<(String, Ipv4Addr, LsaKey)> {
    let tag = row.text(ospf_lsa::INSTANCE_TAG)?.to_string();
    let area_id = fields::ipv4(row, ospf_lsa::AREA_ID).ok()?;
    let lsa_type = LsaType::from_name(row.text(ospf_lsa::LSA_TYPE)?)?;
    let ls_id = fields::ipv4(row, ospf_lsa::LS_ID).ok()?;
    let adv_router = fields::ipv4(row, ospf_lsa::ADV_ROUTER).ok()?;
    Some((
        tag,
        area_id,
        LsaKey {
            lsa_type,
            ls_id,
            adv_router,
        },
    ))
}
