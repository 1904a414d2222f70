//! State publishing through the engine: route-state rules, bulk SPF
//! replacement, and commits that are incomplete or fail.

use rtsync_engine::runtime::{BgpRouteInfo, OspfRouteInfo, ProtocolEvent};
use rtsync_engine::{EngineConfig, EngineError, PassOutcome, Prefix, PublishOutcome, RetryConfig};
use rtsync_store::columns::{bgp_route, ospf_area};
use rtsync_store::CommitStatus;
use rtsync_testkit::prelude::*;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

fn prefix(s: &str) -> Prefix {
    s.parse().unwrap()
}

fn bgp_harness(config: EngineConfig) -> Harness {
    let mut h = Harness::with_config(config);
    let router = h.insert(Table::BgpRouter, &rows::bgp_router(65001));
    h.insert(Table::BgpNeighbor, &rows::bgp_neighbor(router, "10.0.0.2", 65002));
    h.pass();
    h
}

fn route_added(p: &str, selected: bool) -> ProtocolEvent {
    ProtocolEvent::BgpRouteAdded {
        asn: 65001,
        route: BgpRouteInfo {
            prefix: prefix(p),
            peer: "10.0.0.2".parse().unwrap(),
            metric: 0,
            selected,
            path_attributes: BTreeMap::new(),
        },
    }
}

#[test]
fn withdraw_of_selected_route_leaves_store_untouched() {
    let mut h = bgp_harness(EngineConfig::default());
    h.engine.publish(route_added("198.51.100.0/24", true)).unwrap();
    let seq = h.snapshot().seq();
    let commits = h.store.commit_count();

    let err = h
        .engine
        .publish(ProtocolEvent::BgpRouteWithdrawn {
            asn: 65001,
            prefix: prefix("198.51.100.0/24"),
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::RouteStateViolation { .. }));
    assert!(err.is_programming_error());
    assert_eq!(h.snapshot().seq(), seq);
    assert_eq!(h.store.commit_count(), commits);
    assert!(!h.engine.coordinator().is_open());

    // Deselect first, then the withdrawal is legal.
    h.engine
        .publish_batch(vec![
            ProtocolEvent::BgpRouteSelected {
                asn: 65001,
                prefix: prefix("198.51.100.0/24"),
                selected: false,
            },
            ProtocolEvent::BgpRouteWithdrawn {
                asn: 65001,
                prefix: prefix("198.51.100.0/24"),
            },
        ])
        .unwrap();
    let snapshot = h.snapshot();
    let row = snapshot.rows(Table::BgpRoute).next().unwrap();
    assert_eq!(row.text(bgp_route::RIB_STATE), Some("withdraw"));
}

#[test]
fn spf_results_replace_the_area_routes_in_one_commit() {
    let mut h = Harness::new();
    let area = h.insert(Table::OspfArea, &rows::ospf_area("0.0.0.0"));
    h.insert(Table::OspfRouter, &rows::ospf_router("core", &[("0.0.0.0", area)]));
    h.pass();

    let spf = |count: u8, base: u8| ProtocolEvent::OspfSpfCompleted {
        instance_tag: "core".into(),
        area_id: Ipv4Addr::UNSPECIFIED,
        routes: (0..count)
            .map(|i| OspfRouteInfo {
                prefix: prefix(&format!("10.{}.0.0/16", base + i)),
                path_type: "intra_area".into(),
                cost: u32::from(i) + 1,
                nexthops: vec!["10.0.0.2".parse().unwrap()],
            })
            .collect(),
    };

    h.engine.publish(spf(5, 0)).unwrap();
    let before = h.snapshot();
    assert_eq!(before.row_count(Table::OspfRoute), 5);

    assert_eq!(h.engine.publish(spf(3, 100)).unwrap(), PublishOutcome::Applied);
    let after = h.snapshot();
    assert_eq!(after.seq(), before.seq().next());
    assert_eq!(after.row_count(Table::OspfRoute), 3);
    let row = after.get(Table::OspfArea, area).unwrap();
    let listed = row.get(ospf_area::OSPF_ROUTES).refs();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|id| after.get(Table::OspfRoute, *id).is_some()));
    assert_eq!(row.integer(ospf_area::SPF_CALC_COUNT), Some(2));
}

#[test]
fn republished_spf_routes_leave_no_tombstones_behind() {
    let mut h = Harness::new();
    let area = h.insert(Table::OspfArea, &rows::ospf_area("0.0.0.0"));
    h.insert(Table::OspfRouter, &rows::ospf_router("core", &[("0.0.0.0", area)]));
    h.pass();

    for round in 0..16u8 {
        let routes = (0..4u8)
            .map(|i| OspfRouteInfo {
                prefix: prefix(&format!("10.{}.0.0/16", round * 4 + i)),
                path_type: "intra_area".into(),
                cost: 1,
                nexthops: vec!["10.0.0.2".parse().unwrap()],
            })
            .collect();
        h.engine
            .publish(ProtocolEvent::OspfSpfCompleted {
                instance_tag: "core".into(),
                area_id: Ipv4Addr::UNSPECIFIED,
                routes,
            })
            .unwrap();
        h.pass();
        assert_eq!(h.snapshot().tombstone_count(), 0, "round {round}");
    }
    assert_eq!(h.snapshot().row_count(Table::OspfRoute), 4);
    assert_eq!(h.store.tracked_statuses(), 0);
}

#[test]
fn incomplete_commit_is_resolved_on_a_later_pass() {
    let mut h = bgp_harness(EngineConfig::default());
    h.store.defer_commits(true);
    h.runtime_mut().emit(route_added("198.51.100.0/24", false));
    h.runtime_mut().emit(route_added("203.0.113.0/24", false));

    let outcome = h.pass();
    let report = outcome.report().unwrap();
    assert_eq!(report.published.pending, 1);
    assert_eq!(h.engine.coordinator().in_flight(), 1);
    assert!(h.snapshot().is_empty(Table::BgpRoute));

    // The second event waits behind the in-flight commit.
    let outcome = h.pass();
    assert!(matches!(outcome, PassOutcome::Unchanged));
    assert_eq!(h.store.pending_commits(), 1);

    h.store.defer_commits(false);
    h.store.run().unwrap();
    let outcome = h.pass();
    let report = outcome.report().unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.published.published, 1);
    assert_eq!(h.engine.coordinator().in_flight(), 0);
    assert_eq!(h.snapshot().row_count(Table::BgpRoute), 2);
}

#[test]
fn commit_error_backs_off_and_keeps_the_events() {
    let retry = RetryConfig::new()
        .with_initial_delay(Duration::from_secs(60))
        .with_jitter(false);
    let mut h = bgp_harness(EngineConfig::default().with_retry(retry));

    h.store.inject_commit_status(CommitStatus::Error);
    h.runtime_mut().emit(route_added("198.51.100.0/24", true));
    let outcome = h.pass();
    assert_eq!(outcome.report().unwrap().published.requeued, 1);
    let stats = h.engine.coordinator().stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.last_status, Some(CommitStatus::Error));

    let now = Instant::now();
    assert!(!h.engine.coordinator().may_commit(now));
    let remaining = h.engine.coordinator().backoff_remaining(now).unwrap();
    assert!(remaining > Duration::from_secs(50) && remaining <= Duration::from_secs(60));

    // While backing off nothing is attempted and nothing is lost.
    let begun = h.engine.coordinator().stats().begun;
    h.pass();
    assert_eq!(h.engine.coordinator().stats().begun, begun);
    assert_eq!(h.engine.status().queued_events, 1);
    assert!(h.snapshot().is_empty(Table::BgpRoute));
}
