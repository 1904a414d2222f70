//! Reconciliation order and per-row isolation across a full engine pass.

use rtsync_engine::runtime::{BgpRuntime, OspfRuntime, RibRuntime};
use rtsync_engine::{Domain, PassOutcome, Prefix};
use rtsync_store::columns::{bgp_router, ospf_router, route};
use rtsync_testkit::prelude::*;
use std::net::Ipv4Addr;

const BACKBONE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

#[test]
fn area_survives_while_an_interface_remains() {
    let mut h = Harness::new();
    let area = h.insert(Table::OspfArea, &rows::ospf_area("0.0.0.0"));
    let router = h.insert(Table::OspfRouter, &rows::ospf_router("core", &[("0.0.0.0", area)]));
    let iface = h.insert(Table::OspfInterface, &rows::ospf_interface("eth0", "core", "0.0.0.0"));
    h.pass();
    assert!(h.runtime().ospf_router("core").unwrap().areas.contains_key(&BACKBONE));

    h.transact(|txn| {
        let snapshot = h.snapshot();
        let router_row = snapshot.get(Table::OspfRouter, router).unwrap();
        txn.update(router_row, ospf_router::AREAS, Value::Map(Default::default()))
            .unwrap();
        txn.delete(snapshot.get(Table::OspfArea, area).unwrap()).unwrap();
    });
    let outcome = h.pass();
    let ospf = outcome.report().unwrap().domain(Domain::Ospf).unwrap();
    assert_eq!(ospf.deferred, 1);
    assert!(h.runtime().ospf_router("core").unwrap().areas.contains_key(&BACKBONE));
    assert_eq!(h.runtime().ospf_interface("eth0").unwrap().area_id, BACKBONE);

    h.delete(&[(Table::OspfInterface, iface)]);
    h.pass();
    assert!(h.runtime().ospf_interface("eth0").is_none());
    assert!(h.runtime().ospf_router("core").unwrap().areas.is_empty());
    assert_eq!(h.engine.status().pending_teardown, 0);
}

#[test]
fn router_with_neighbors_is_destroyed_after_them() {
    let mut h = Harness::new();
    let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
    let a = h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.2", 65002));
    let b = h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.3", 65003));
    h.pass();
    h.runtime_mut().take_ops();

    h.delete(&[
        (Table::BgpRouter, router),
        (Table::BgpNeighbor, a),
        (Table::BgpNeighbor, b),
    ]);
    h.pass();
    let calls: Vec<_> = h.runtime().ops().iter().map(|op| op.call).collect();
    assert_eq!(
        calls,
        vec!["destroy_bgp_neighbor", "destroy_bgp_neighbor", "destroy_bgp_router"]
    );
    assert_eq!(h.runtime().instance_count(), 0);
}

#[test]
fn router_id_change_calls_only_its_setter() {
    let mut h = Harness::new();
    let router = h.insert(
        Table::BgpRouter,
        &[
            (bgp_router::ASN, Value::from(65001u32)),
            (bgp_router::NETWORKS, Value::text_list(["192.0.2.0/24"])),
            (bgp_router::MAXIMUM_PATHS, Value::from(4u32)),
        ],
    );
    h.pass();
    h.runtime_mut().take_ops();

    h.update(Table::BgpRouter, router, &[(bgp_router::ROUTER_ID, Value::text("10.0.0.1"))]);
    let outcome = h.pass();
    assert_eq!(outcome.report().unwrap().modified, 1);
    let calls: Vec<_> = h.runtime().ops().iter().map(|op| op.call).collect();
    assert_eq!(calls, vec!["set_bgp_router_id"]);

    let state = h.runtime().bgp_router(65001).unwrap();
    assert_eq!(state.router_id, Some(Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq!(state.maximum_paths, 4);
    assert_eq!(state.networks.len(), 1);
}

#[test]
fn malformed_prefix_fails_only_its_row() {
    let mut h = Harness::new();
    let bad = h.insert(Table::Route, &rows::static_route("10.1.2.3/8", "192.0.2.1"));
    h.insert(Table::Route, &rows::static_route("10.2.0.0/16", "192.0.2.1"));
    let router = h.insert(
        Table::BgpRouter,
        &[
            (bgp_router::ASN, Value::from(65001u32)),
            (bgp_router::NETWORKS, Value::text_list(["300.0.0.0/8"])),
        ],
    );
    h.insert(Table::BgpRouter, &rows::bgp_router(65002));

    let outcome = h.pass();
    let report = outcome.report().unwrap();
    assert_eq!(report.failure_count(), 2);
    let rib = report.domain(Domain::Rib).unwrap();
    assert_eq!(rib.failures[0].row_id, bad);
    let bgp = report.domain(Domain::Bgp).unwrap();
    assert_eq!(bgp.failures[0].row_id, router);

    assert_eq!(h.runtime().static_routes(), vec!["10.2.0.0/16".parse::<Prefix>().unwrap()]);
    assert_eq!(h.runtime().bgp_routers(), vec![65002]);
    assert_eq!(h.engine.stats().row_failures, 2);

    // A later fix to the bad row is picked up as a modification.
    h.update(Table::Route, bad, &[(route::PREFIX, Value::text("10.1.0.0/16"))]);
    assert!(matches!(h.pass(), PassOutcome::Applied(_)));
    assert_eq!(h.runtime().static_routes().len(), 2);
}
