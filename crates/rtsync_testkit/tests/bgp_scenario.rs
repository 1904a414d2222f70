//! End-to-end BGP: configuration in, protocol state out, teardown when the
//! router table is emptied without deletion markers.

use rtsync_engine::runtime::{BgpPeerState, BgpRouteInfo, BgpRuntime, ProtocolEvent};
use rtsync_engine::PassOutcome;
use rtsync_store::columns::{bgp_neighbor, bgp_route};
use rtsync_testkit::prelude::*;
use std::collections::BTreeMap;
use std::net::IpAddr;

fn peer() -> IpAddr {
    "10.0.0.2".parse().unwrap()
}

#[test]
fn bgp_router_lifecycle() {
    let mut h = Harness::new();
    let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
    let neighbor = h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.2", 65002));

    let outcome = h.pass();
    assert_eq!(outcome.report().unwrap().inserted, 3);
    let state = h.runtime().bgp_router(65001).unwrap();
    assert_eq!(state.neighbors[&peer()].remote_as, 65002);

    // The protocol brings the session up and learns a route.
    h.runtime_mut().emit(ProtocolEvent::BgpNeighborStateChanged {
        asn: 65001,
        neighbor: peer(),
        state: BgpPeerState::Established,
    });
    h.runtime_mut().emit(ProtocolEvent::BgpRouteAdded {
        asn: 65001,
        route: BgpRouteInfo {
            prefix: "203.0.113.0/24".parse().unwrap(),
            peer: peer(),
            metric: 100,
            selected: true,
            path_attributes: BTreeMap::from([("as_path".to_string(), "65002".to_string())]),
        },
    });
    let outcome = h.pass();
    assert_eq!(outcome.report().unwrap().published.published, 2);

    let snapshot = h.snapshot();
    let row = snapshot.get(Table::BgpNeighbor, neighbor).unwrap();
    let status = row.get(bgp_neighbor::STATUS).as_map().unwrap();
    assert_eq!(status[bgp_neighbor::STATUS_PEER_STATE], Value::text("established"));
    let route = snapshot.rows(Table::BgpRoute).next().unwrap();
    assert_eq!(route.reference(bgp_route::BGP_ROUTER), Some(router));
    assert_eq!(route.boolean(bgp_route::SELECTED), Some(true));

    // Publishing did not touch configuration columns, so there is nothing
    // to reconcile on the next pass.
    h.runtime_mut().take_ops();
    h.pass();
    assert!(h.runtime().ops().is_empty());

    // A resync that empties the router table leaves no deletion markers.
    h.store.truncate_table(Table::BgpRouter);
    let outcome = h.pass();
    assert!(matches!(outcome, PassOutcome::Applied(_)));
    let calls: Vec<_> = h.runtime().ops().iter().map(|op| op.call).collect();
    assert_eq!(calls, vec!["destroy_bgp_neighbor", "destroy_bgp_router"]);
    assert!(h.runtime().bgp_routers().is_empty());
    assert_eq!(h.runtime().instance_count(), 0);
}

#[test]
fn neighbor_of_rejected_router_is_not_created() {
    let mut h = Harness::new();
    let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
    h.runtime_mut().reject("65001");
    h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.2", 65002));

    let outcome = h.pass();
    let report = outcome.report().unwrap();
    assert!(report.failure_count() >= 1);
    assert!(h.runtime().bgp_router(65001).is_none());
    assert_eq!(h.runtime().instance_count(), 0);
}
