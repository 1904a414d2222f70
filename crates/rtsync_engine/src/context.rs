//! Reconciler context: the state of one engine instance and its pass.
//!
//! A pass runs these steps in order and never suspends:
//!
//! 1. Skip if the store is disconnected.
//! 2. Skip unless this instance holds the store lock.
//! 3. Skip until `System.cur_cfg > 0` has been seen once.
//! 4. Settle commits that were in flight.
//! 5. If the sequence number moved, detect changes and run every enabled
//!    reconciler over them.
//! 6. Drain runtime events into the publisher and flush it.

use crate::change::{ChangeDetector, Subscriptions};
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorStats, TransactionCoordinator};
use crate::error::EngineResult;
use crate::index::SnapshotIndex;
use crate::publish::{FlushReport, PublishOutcome, PublisherStats, StatePublisher};
use crate::ratelimit::RateLimiter;
use crate::reconcile::{
    BgpReconciler, Domain, OspfReconciler, PassInput, ReconcileResult, Reconciler,
    RibReconciler,
};
use crate::runtime::{ProtocolEvent, ProtocolRuntime};
use rtsync_store::columns::system;
use rtsync_store::{LockStatus, SequenceNumber, Snapshot, StoreClient, Table};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The store is not connected.
    Disconnected,
    /// Another instance holds the store lock.
    LockContended,
    /// The lock has not been granted yet.
    LockNotHeld,
    /// The system has not been configured yet.
    NotConfigured,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Disconnected => "store disconnected",
            SkipReason::LockContended => "lock held by another instance",
            SkipReason::LockNotHeld => "lock not granted yet",
            SkipReason::NotConfigured => "system not configured",
        })
    }
}

/// Result of one reconciler within a pass.
#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    /// The reconciler's domain.
    pub domain: Domain,
    /// What it did.
    #[serde(flatten)]
    pub result: ReconcileResult,
}

/// Everything one applied pass did.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    /// Sequence number processed before the pass.
    pub from_seq: SequenceNumber,
    /// Sequence number processed by the pass.
    pub to_seq: SequenceNumber,
    /// Inserted rows seen.
    pub inserted: usize,
    /// Modified rows seen.
    pub modified: usize,
    /// Deleted rows seen.
    pub deleted: usize,
    /// Per-reconciler results.
    pub domains: Vec<DomainReport>,
    /// In-flight commits settled.
    pub resolved: usize,
    /// Publisher activity.
    pub published: FlushReport,
}

impl PassReport {
    fn new(from_seq: SequenceNumber, to_seq: SequenceNumber) -> Self {
        Self {
            from_seq,
            to_seq,
            inserted: 0,
            modified: 0,
            deleted: 0,
            domains: Vec::new(),
            resolved: 0,
            published: FlushReport::default(),
        }
    }

    /// Number of change records the pass reconciled.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.inserted + self.modified + self.deleted
    }

    /// Row failures across all reconcilers.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.domains.iter().map(|d| d.result.failures.len()).sum()
    }

    /// Result of one domain, if it ran.
    #[must_use]
    pub fn domain(&self, domain: Domain) -> Option<&ReconcileResult> {
        self.domains
            .iter()
            .find(|d| d.domain == domain)
            .map(|d| &d.result)
    }
}

/// Outcome of [`ReconcilerContext::run_pass`].
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// Gated off.
    Skipped(SkipReason),
    /// Nothing changed and nothing was published.
    Unchanged,
    /// The pass did work.
    Applied(PassReport),
}

impl PassOutcome {
    /// The report of an applied pass.
    #[must_use]
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Applied(report) => Some(report),
            _ => None,
        }
    }
}

/// Statistics for the engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Passes run.
    pub passes: u64,
    /// Passes that did work.
    pub applied: u64,
    /// Passes skipped by a gate.
    pub skipped: u64,
    /// Row failures over all passes.
    pub row_failures: u64,
    /// Last skip reason.
    pub last_skip: Option<SkipReason>,
}

/// Introspection view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Identity this instance requests the lock under.
    pub lock_owner: String,
    /// Whether the system-configured latch is set.
    pub system_configured: bool,
    /// Last processed sequence number.
    pub last_seq: SequenceNumber,
    /// Parents waiting for their children to go.
    pub pending_teardown: usize,
    /// Live rows waiting to be initialized again.
    pub unsynced_rows: usize,
    /// Commits awaiting a final status.
    pub in_flight: usize,
    /// Queued events.
    pub queued_events: usize,
    /// Engine counters.
    pub stats: EngineStats,
    /// Coordinator counters.
    pub coordinator: CoordinatorStats,
    /// Publisher counters.
    pub publisher: PublisherStats,
    /// Report of the last applied pass.
    pub last_report: Option<PassReport>,
}

/// One engine instance: reconcilers, publisher and coordinator over a
/// store and a protocol runtime.
pub struct ReconcilerContext<R: ProtocolRuntime> {
    config: EngineConfig,
    store: Arc<dyn StoreClient>,
    runtime: R,
    detector: ChangeDetector,
    reconcilers: Vec<Box<dyn Reconciler>>,
    coordinator: TransactionCoordinator,
    publisher: StatePublisher,
    last_seq: SequenceNumber,
    system_configured: bool,
    lock_owner: String,
    lock_log: RateLimiter,
    config_log: RateLimiter,
    stats: EngineStats,
    last_report: Option<PassReport>,
}

impl<R: ProtocolRuntime> ReconcilerContext<R> {
    /// Creates an engine, subscribes to the configuration columns of the
    /// enabled domains and requests the store lock.
    pub fn new(config: EngineConfig, store: Arc<dyn StoreClient>, runtime: R) -> Self {
        let subscriptions = Subscriptions::for_domains(config.domains);
        subscriptions.register(store.as_ref());

        let mut reconcilers: Vec<Box<dyn Reconciler>> = Vec::new();
        if config.domains.bgp {
            reconcilers.push(Box::new(BgpReconciler::new()));
        }
        if config.domains.ospf {
            reconcilers.push(Box::new(OspfReconciler::new()));
        }
        if config.domains.rib {
            reconcilers.push(Box::new(RibReconciler::new()));
        }

        let lock_owner = Uuid::new_v4().to_string();
        store.request_lock(&config.lock_name, &lock_owner);
        info!(
            lock = %config.lock_name,
            owner = %lock_owner,
            domains = reconcilers.len(),
            "engine created"
        );

        Self {
            coordinator: TransactionCoordinator::new(Arc::clone(&store), config.retry.clone()),
            detector: ChangeDetector::new(subscriptions),
            lock_log: RateLimiter::new(config.log_burst, config.log_interval),
            config_log: RateLimiter::new(config.log_burst, config.log_interval),
            config,
            store,
            runtime,
            reconcilers,
            publisher: StatePublisher::new(),
            last_seq: SequenceNumber::ZERO,
            system_configured: false,
            lock_owner,
            stats: EngineStats::default(),
            last_report: None,
        }
    }

    /// Runs one pass.
    pub fn run_pass(&mut self) -> PassOutcome {
        self.stats.passes += 1;

        if !self.store.is_connected() {
            return self.skip(SkipReason::Disconnected);
        }
        match self.store.lock_status(&self.config.lock_name, &self.lock_owner) {
            LockStatus::Held => {}
            LockStatus::Contended => return self.skip(SkipReason::LockContended),
            LockStatus::NotHeld => {
                self.store
                    .request_lock(&self.config.lock_name, &self.lock_owner);
                return self.skip(SkipReason::LockNotHeld);
            }
        }

        let snapshot = self.store.snapshot();
        if !self.system_configured {
            if cur_cfg(&snapshot) <= 0 {
                return self.skip(SkipReason::NotConfigured);
            }
            self.system_configured = true;
            info!(seq = %snapshot.seq(), "system configured");
        }

        let mut report = PassReport::new(self.last_seq, snapshot.seq());

        let resolved = self.coordinator.poll_in_flight();
        report.resolved = resolved.len();
        self.publisher.resolve(&resolved);

        if snapshot.seq() != self.last_seq {
            self.reconcile(&snapshot, &mut report);
        }

        let events = self.runtime.drain_events();
        for event in events {
            self.publisher.enqueue(event);
        }
        if self.publisher.queued() > 0 {
            report.published = self.publisher.flush(&mut self.coordinator);
        }

        let failures = report.failure_count();
        self.stats.row_failures += failures as u64;
        let idle = report.from_seq == report.to_seq
            && report.resolved == 0
            && report.published == FlushReport::default();
        if idle {
            return PassOutcome::Unchanged;
        }

        self.stats.applied += 1;
        info!(
            from = %report.from_seq,
            to = %report.to_seq,
            changes = report.change_count(),
            failures,
            published = report.published.published,
            "pass complete"
        );
        self.last_report = Some(report.clone());
        PassOutcome::Applied(report)
    }

    fn reconcile(&mut self, snapshot: &Snapshot, report: &mut PassReport) {
        let index = Arc::new(SnapshotIndex::build(snapshot));
        let (seq, changes) = self.detector.detect(snapshot, self.last_seq);
        (report.inserted, report.modified, report.deleted) = changes.counts();
        let input = PassInput {
            snapshot,
            index: &index,
            changes: &changes,
        };
        for reconciler in &mut self.reconcilers {
            let result = reconciler.apply(&input, &mut self.runtime);
            if result.changed_runtime() || !result.failures.is_empty() {
                debug!(domain = %reconciler.domain(), ?result, "reconciled");
            }
            report.domains.push(DomainReport {
                domain: reconciler.domain(),
                result,
            });
        }
        self.last_seq = seq;
        report.to_seq = seq;
        self.store.acknowledge(&self.lock_owner, seq);
        self.publisher.prime(index);
    }

    fn skip(&mut self, reason: SkipReason) -> PassOutcome {
        self.stats.skipped += 1;
        self.stats.last_skip = Some(reason);
        let limiter = match reason {
            SkipReason::Disconnected => {
                debug!(%reason, "pass skipped");
                return PassOutcome::Skipped(reason);
            }
            SkipReason::LockContended | SkipReason::LockNotHeld => &mut self.lock_log,
            SkipReason::NotConfigured => &mut self.config_log,
        };
        if let Some(suppressed) = limiter.check(Instant::now()) {
            warn!(%reason, suppressed, "pass skipped");
        }
        PassOutcome::Skipped(reason)
    }

    /// Publishes one event right away, outside a pass.
    pub fn publish(&mut self, event: ProtocolEvent) -> EngineResult<PublishOutcome> {
        self.publisher.publish(&mut self.coordinator, event)
    }

    /// Publishes events in one transaction, outside a pass.
    pub fn publish_batch(&mut self, events: Vec<ProtocolEvent>) -> EngineResult<PublishOutcome> {
        self.publisher.publish_batch(&mut self.coordinator, events)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The store.
    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// The protocol runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The protocol runtime, mutably.
    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Last processed sequence number.
    #[must_use]
    pub fn last_seq(&self) -> SequenceNumber {
        self.last_seq
    }

    /// Whether the system-configured latch is set.
    #[must_use]
    pub fn is_system_configured(&self) -> bool {
        self.system_configured
    }

    /// Report of the last applied pass.
    #[must_use]
    pub fn last_report(&self) -> Option<&PassReport> {
        self.last_report.as_ref()
    }

    /// Returns the engine statistics.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Snapshot of the engine's state for introspection.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            lock_owner: self.lock_owner.clone(),
            system_configured: self.system_configured,
            last_seq: self.last_seq,
            pending_teardown: self.reconcilers.iter().map(|r| r.pending_teardown()).sum(),
            unsynced_rows: self.reconcilers.iter().map(|r| r.unsynced_rows()).sum(),
            in_flight: self.coordinator.in_flight(),
            queued_events: self.publisher.queued(),
            stats: self.stats.clone(),
            coordinator: self.coordinator.stats().clone(),
            publisher: self.publisher.stats().clone(),
            last_report: self.last_report.clone(),
        }
    }

    /// Engine status and runtime state as JSON.
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        serde_json::json!({
            "engine": serde_json::to_value(self.status()).unwrap_or(serde_json::Value::Null),
            "runtime": self.runtime.dump(),
        })
    }
}

impl<R: ProtocolRuntime> fmt::Debug for ReconcilerContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerContext")
            .field("lock_owner", &self.lock_owner)
            .field("last_seq", &self.last_seq)
            .field("system_configured", &self.system_configured)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn cur_cfg(snapshot: &Snapshot) -> i64 {
    snapshot
        .rows(Table::System)
        .next()
        .and_then(|row| row.integer(system::CUR_CFG))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BgpPeerState, BgpRuntime, MemoryRuntime};
    use rtsync_store::columns::{bgp_neighbor, bgp_router};
    use rtsync_store::{CommitStatus, MemoryStore, RowId, Value};
    use std::collections::BTreeMap;

    fn cols(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn insert(store: &MemoryStore, table: Table, pairs: &[(&str, Value)]) -> RowId {
        let mut txn = store.begin().unwrap();
        let id = txn.insert(table, cols(pairs)).unwrap();
        assert_eq!(store.commit(txn), CommitStatus::Success);
        id
    }

    fn engine(store: &Arc<MemoryStore>) -> ReconcilerContext<MemoryRuntime> {
        ReconcilerContext::new(
            EngineConfig::default(),
            Arc::clone(store) as Arc<dyn StoreClient>,
            MemoryRuntime::new(),
        )
    }

    fn configured_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        insert(&store, Table::System, &[(system::CUR_CFG, Value::from(1i64))]);
        store
    }

    #[test]
    fn waits_for_system_configuration() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = engine(&store);
        insert(&store, Table::BgpRouter, &[(bgp_router::ASN, Value::from(65001i64))]);

        assert!(matches!(
            engine.run_pass(),
            PassOutcome::Skipped(SkipReason::NotConfigured)
        ));
        assert!(engine.runtime().bgp_routers().is_empty());

        insert(&store, Table::System, &[(system::CUR_CFG, Value::from(1i64))]);
        let outcome = engine.run_pass();
        assert!(engine.is_system_configured());
        assert_eq!(outcome.report().unwrap().inserted, 2);
        assert_eq!(engine.runtime().bgp_routers(), vec![65001]);
    }

    #[test]
    fn subscribes_to_configuration_columns() {
        let store = configured_store();
        let _engine = engine(&store);
        let subs = store.subscriptions();
        assert!(subs[&Table::BgpRouter].contains(bgp_router::ASN));
        assert!(!subs[&Table::BgpNeighbor].contains(bgp_neighbor::STATUS));
    }

    #[test]
    fn lock_contention_skips_the_pass() {
        let store = configured_store();
        store.seize_lock("rtsync", "someone-else");
        let mut engine = engine(&store);
        insert(&store, Table::BgpRouter, &[(bgp_router::ASN, Value::from(65001i64))]);

        for _ in 0..3 {
            assert!(matches!(
                engine.run_pass(),
                PassOutcome::Skipped(SkipReason::LockContended)
            ));
        }
        assert!(engine.runtime().bgp_routers().is_empty());
        assert_eq!(engine.last_seq(), SequenceNumber::ZERO);

        store.release_lock("rtsync");
        assert!(matches!(engine.run_pass(), PassOutcome::Applied(_)));
        assert_eq!(engine.runtime().bgp_routers(), vec![65001]);
    }

    #[test]
    fn unchanged_sequence_does_nothing() {
        let store = configured_store();
        let mut engine = engine(&store);
        engine.run_pass();
        engine.runtime_mut().take_ops();

        assert!(matches!(engine.run_pass(), PassOutcome::Unchanged));
        assert!(engine.runtime().ops().is_empty());
    }

    #[test]
    fn runtime_events_are_published() {
        let store = configured_store();
        let router = insert(&store, Table::BgpRouter, &[(bgp_router::ASN, Value::from(65001i64))]);
        let neighbor = insert(
            &store,
            Table::BgpNeighbor,
            &[
                (bgp_neighbor::BGP_ROUTER, Value::Ref(router)),
                (bgp_neighbor::IP_ADDRESS, Value::text("10.0.0.2")),
                (bgp_neighbor::REMOTE_AS, Value::from(65002i64)),
            ],
        );
        let mut engine = engine(&store);
        engine.run_pass();

        engine
            .runtime_mut()
            .emit(ProtocolEvent::BgpNeighborStateChanged {
                asn: 65001,
                neighbor: "10.0.0.2".parse().unwrap(),
                state: BgpPeerState::Established,
            });
        let outcome = engine.run_pass();
        assert_eq!(outcome.report().unwrap().published.published, 1);

        let snapshot = store.snapshot();
        let row = snapshot.get(Table::BgpNeighbor, neighbor).unwrap();
        assert!(row.get(bgp_neighbor::STATUS).as_map().is_some());

        // The status write is not a subscribed column; the next pass sees
        // a new sequence number but no changes.
        let outcome = engine.run_pass();
        let report = outcome.report().unwrap();
        assert_eq!(report.change_count(), 0);
        assert!(engine.runtime().bgp_router(65001).is_some());
    }

    #[test]
    fn status_reports_counters() {
        let store = configured_store();
        let mut engine = engine(&store);
        engine.run_pass();
        let status = engine.status();
        assert!(status.system_configured);
        assert_eq!(status.stats.passes, 1);
        let json = engine.dump();
        assert_eq!(json["engine"]["system_configured"], true);
        assert!(json["runtime"].is_object());
    }
}
