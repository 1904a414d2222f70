//! State publisher: dynamic protocol state back into the store.
//!
//! Each event is resolved against its declarative parent row in a fresh
//! snapshot and turned into writes on status columns or on purely dynamic
//! rows. Configuration rows are never created here.
//!
//! Events are published in order. While a commit is in flight the queue
//! holds back, so a later event never misses a row an earlier one is still
//! writing.

use crate::coordinator::TransactionCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::index::SnapshotIndex;
use crate::prefix::Prefix;
use crate::runtime::{BgpPeerState, LsaKey, LsaType, ProtocolEvent};
use rtsync_store::columns::{
    bgp_neighbor, bgp_route, ospf_area, ospf_interface, ospf_lsa, ospf_neighbor, ospf_route,
    route,
};
use rtsync_store::{CommitStatus, Row, RowId, Snapshot, Table, Transaction, TxnId, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to a published unit of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Written to the store.
    Applied,
    /// Accepted but the store already held that state.
    Unchanged,
    /// Parked until the store resolves the transaction.
    Pending(TxnId),
    /// Put back on the queue after a contended or failed commit.
    Requeued(CommitStatus),
}

/// Statistics for the publisher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublisherStats {
    /// Events written (or found already written).
    pub published: u64,
    /// Events dropped for a missing parent or an invalid state change.
    pub dropped: u64,
    /// Events put back on the queue.
    pub requeued: u64,
    /// Transactions committed.
    pub transactions: u64,
}

/// Result of draining the queue once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Events written.
    pub published: usize,
    /// Events dropped.
    pub dropped: usize,
    /// Events put back for a later pass.
    pub requeued: usize,
    /// Events waiting on an in-flight commit.
    pub pending: usize,
}

/// Queues protocol events and writes them to the store.
#[derive(Debug, Default)]
pub struct StatePublisher {
    queue: VecDeque<Vec<ProtocolEvent>>,
    awaiting: BTreeMap<TxnId, Vec<ProtocolEvent>>,
    index: Option<Arc<SnapshotIndex>>,
    stats: PublisherStats,
}

impl StatePublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for its own transaction.
    pub fn enqueue(&mut self, event: ProtocolEvent) {
        self.queue.push_back(vec![event]);
    }

    /// Queues events that must be committed together.
    pub fn enqueue_batch(&mut self, events: Vec<ProtocolEvent>) {
        if !events.is_empty() {
            self.queue.push_back(events);
        }
    }

    /// Number of queued events.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }

    /// Number of events parked on in-flight commits.
    #[must_use]
    pub fn awaiting(&self) -> usize {
        self.awaiting.values().map(Vec::len).sum()
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Reuses an index already built for the current snapshot.
    pub fn prime(&mut self, index: Arc<SnapshotIndex>) {
        self.index = Some(index);
    }

    /// Publishes one event in its own transaction.
    pub fn publish(
        &mut self,
        coord: &mut TransactionCoordinator,
        event: ProtocolEvent,
    ) -> EngineResult<PublishOutcome> {
        self.publish_batch(coord, vec![event])
    }

    /// Publishes events in one transaction.
    ///
    /// A route state violation anywhere in the batch fails it before a
    /// transaction is opened. A missing parent row drops the whole batch.
    /// When no transaction can be opened the events stay queued.
    pub fn publish_batch(
        &mut self,
        coord: &mut TransactionCoordinator,
        events: Vec<ProtocolEvent>,
    ) -> EngineResult<PublishOutcome> {
        if events.is_empty() {
            return Ok(PublishOutcome::Unchanged);
        }
        let count = events.len() as u64;
        let snapshot = coord.store().snapshot();
        let index = self.index_for(&snapshot);

        if let Err(e) = check_route_states(&index, &events) {
            warn!(error = %e, events = count, "route state violation, events dropped");
            self.stats.dropped += count;
            return Err(e);
        }

        let mut handle = match coord.begin() {
            Ok(handle) => handle,
            Err(e) => {
                debug!(error = %e, events = count, "cannot open transaction, events kept");
                self.stats.requeued += count;
                self.queue.push_front(events);
                return Err(e);
            }
        };

        let applied = {
            let mut batch = Batch::new(&mut handle, &snapshot, &index);
            events
                .iter()
                .try_for_each(|event| batch.apply(event).map_err(|e| (event.name(), e)))
        };
        if let Err((name, e)) = applied {
            coord.abort(handle);
            if requeues(&e) {
                self.stats.requeued += count;
                self.queue.push_front(events);
            } else {
                warn!(event = name, error = %e, "event dropped");
                self.stats.dropped += count;
            }
            return Err(e);
        }

        let id = handle.id();
        let status = coord.commit(handle);
        Ok(match status {
            CommitStatus::Success | CommitStatus::Unchanged => {
                self.stats.published += count;
                self.stats.transactions += 1;
                if status == CommitStatus::Success {
                    PublishOutcome::Applied
                } else {
                    PublishOutcome::Unchanged
                }
            }
            CommitStatus::Incomplete => {
                self.awaiting.insert(id, events);
                PublishOutcome::Pending(id)
            }
            CommitStatus::Contended | CommitStatus::Error => {
                debug!(txn = %id, ?status, events = count, "publish requeued");
                self.stats.requeued += count;
                self.queue.push_front(events);
                PublishOutcome::Requeued(status)
            }
        })
    }

    /// Publishes queued events until the queue is empty, a commit is in
    /// flight, or the store refuses.
    pub fn flush(&mut self, coord: &mut TransactionCoordinator) -> FlushReport {
        let mut report = FlushReport::default();
        while self.awaiting.is_empty() {
            let Some(events) = self.queue.pop_front() else {
                break;
            };
            let count = events.len();
            match self.publish_batch(coord, events) {
                Ok(PublishOutcome::Applied | PublishOutcome::Unchanged) => {
                    report.published += count;
                }
                Ok(PublishOutcome::Pending(_)) => report.pending += count,
                Ok(PublishOutcome::Requeued(_)) => {
                    report.requeued += count;
                    break;
                }
                Err(e) if requeues(&e) => {
                    report.requeued += count;
                    break;
                }
                Err(_) => report.dropped += count,
            }
        }
        report
    }

    /// Settles events parked on commits that reached a final status.
    pub fn resolve(&mut self, resolved: &[(TxnId, CommitStatus)]) {
        for (id, status) in resolved {
            let Some(events) = self.awaiting.remove(id) else {
                continue;
            };
            let count = events.len() as u64;
            if status.is_done() {
                self.stats.published += count;
                self.stats.transactions += 1;
            } else {
                debug!(txn = %id, ?status, events = count, "in-flight publish requeued");
                self.stats.requeued += count;
                self.queue.push_front(events);
            }
        }
    }

    fn index_for(&mut self, snapshot: &Snapshot) -> Arc<SnapshotIndex> {
        match &self.index {
            Some(index) if index.seq() == snapshot.seq() => Arc::clone(index),
            _ => {
                let index = Arc::new(SnapshotIndex::build(snapshot));
                self.index = Some(Arc::clone(&index));
                index
            }
        }
    }
}

/// Store-level failures keep the events; event-level failures drop them.
fn requeues(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Store(_)
            | EngineError::BackoffActive { .. }
            | EngineError::TransactionAlreadyOpen
    )
}

/// Rejects announce/withdraw events that contradict the route's selected
/// flag, as seen after the events before them in the same batch.
fn check_route_states(index: &SnapshotIndex, events: &[ProtocolEvent]) -> EngineResult<()> {
    let mut selected: HashMap<(u32, Prefix), Option<bool>> = HashMap::new();
    for event in events {
        match event {
            ProtocolEvent::BgpRouteAdded { asn, route } => {
                selected.insert((*asn, route.prefix), Some(route.selected));
            }
            ProtocolEvent::BgpRouteSelected {
                asn,
                prefix,
                selected: flag,
            } => {
                selected.insert((*asn, *prefix), Some(*flag));
            }
            ProtocolEvent::BgpRouteDeleted { asn, prefix } => {
                selected.insert((*asn, *prefix), None);
            }
            ProtocolEvent::BgpRouteAnnounced { asn, prefix }
            | ProtocolEvent::BgpRouteWithdrawn { asn, prefix } => {
                let current = match selected.get(&(*asn, *prefix)) {
                    Some(flag) => *flag,
                    None => index
                        .bgp_route(*asn, *prefix)
                        .map(|row| row.boolean(bgp_route::SELECTED).unwrap_or(false)),
                };
                // A missing route is reported when the event is applied.
                let Some(current) = current else { continue };
                let announce = matches!(event, ProtocolEvent::BgpRouteAnnounced { .. });
                if current != announce {
                    return Err(EngineError::RouteStateViolation {
                        prefix: prefix.to_string(),
                        action: if announce { "announce" } else { "withdraw" },
                        selected: current,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Key of a dynamic row that a batch may insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    BgpRoute(u32, Prefix),
    OspfNeighbor(String, Ipv4Addr),
    Lsa(String, Ipv4Addr, LsaKey),
}

/// A row as the batch sees it: stored in the snapshot or inserted by the
/// batch itself.
#[derive(Debug, Clone)]
enum Target {
    Stored(Arc<Row>),
    Staged(RowId),
}

impl Target {
    fn id(&self) -> RowId {
        match self {
            Target::Stored(row) => row.id(),
            Target::Staged(id) => *id,
        }
    }
}

/// Writes of one transaction, with an overlay so later events in the same
/// batch see the writes of earlier ones.
struct Batch<'a> {
    txn: &'a mut Transaction,
    snapshot: &'a Snapshot,
    index: &'a SnapshotIndex,
    staged: HashMap<RowKey, RowId>,
    values: HashMap<RowId, BTreeMap<String, Value>>,
    removed: HashSet<RowId>,
}

impl<'a> Batch<'a> {
    fn new(txn: &'a mut Transaction, snapshot: &'a Snapshot, index: &'a SnapshotIndex) -> Self {
        Self {
            txn,
            snapshot,
            index,
            staged: HashMap::new(),
            values: HashMap::new(),
            removed: HashSet::new(),
        }
    }

    fn parent(
        &self,
        row: Option<&Arc<Row>>,
        table: Table,
        key: impl std::fmt::Display,
    ) -> EngineResult<Target> {
        match row {
            Some(row) if !self.removed.contains(&row.id()) => Ok(Target::Stored(Arc::clone(row))),
            _ => Err(EngineError::missing(table, key)),
        }
    }

    fn lookup(&self, key: &RowKey) -> Option<Target> {
        if let Some(id) = self.staged.get(key) {
            return Some(Target::Staged(*id));
        }
        let row = match key {
            RowKey::BgpRoute(asn, prefix) => self.index.bgp_route(*asn, *prefix),
            RowKey::OspfNeighbor(iface, rid) => self.index.ospf_neighbor(iface, *rid),
            RowKey::Lsa(tag, area, lsa) => self.index.ospf_lsa(tag, *area, lsa),
        }?;
        if self.removed.contains(&row.id()) {
            return None;
        }
        Some(Target::Stored(Arc::clone(row)))
    }

    fn value(&self, table: Table, id: RowId, column: &str) -> Value {
        if let Some(value) = self.values.get(&id).and_then(|cols| cols.get(column)) {
            return value.clone();
        }
        self.snapshot
            .get(table, id)
            .map(|row| row.get(column).clone())
            .unwrap_or_default()
    }

    fn set(&mut self, target: &Target, column: &str, value: Value) -> EngineResult<()> {
        match target {
            Target::Stored(row) => self.txn.update(row, column, value.clone())?,
            Target::Staged(id) => self.txn.amend_insert(*id, column, value.clone())?,
        }
        self.values
            .entry(target.id())
            .or_default()
            .insert(column.to_string(), value);
        Ok(())
    }

    fn insert(
        &mut self,
        table: Table,
        key: Option<RowKey>,
        columns: BTreeMap<String, Value>,
    ) -> EngineResult<RowId> {
        let id = self.txn.insert(table, columns.clone())?;
        self.values.insert(id, columns);
        if let Some(key) = key {
            self.staged.insert(key, id);
        }
        Ok(id)
    }

    fn remove(&mut self, target: &Target) -> EngineResult<()> {
        match target {
            Target::Stored(row) => {
                self.txn.delete(row)?;
                self.removed.insert(row.id());
            }
            Target::Staged(id) => {
                self.txn.discard_insert(*id)?;
                self.staged.retain(|_, staged| staged != id);
            }
        }
        self.values.remove(&target.id());
        Ok(())
    }

    fn apply(&mut self, event: &ProtocolEvent) -> EngineResult<()> {
        match event {
            ProtocolEvent::BgpRouteAdded { asn, route } => {
                let router = self.parent(self.index.bgp_router(*asn), Table::BgpRouter, asn)?;
                let attributes = Value::map(
                    route
                        .path_attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::text(v))),
                );
                let key = RowKey::BgpRoute(*asn, route.prefix);
                if let Some(target) = self.lookup(&key) {
                    self.set(&target, bgp_route::PEER, Value::text(route.peer.to_string()))?;
                    self.set(&target, bgp_route::METRIC, Value::from(route.metric))?;
                    self.set(&target, bgp_route::SELECTED, Value::from(route.selected))?;
                    self.set(&target, bgp_route::PATH_ATTRIBUTES, attributes)?;
                } else {
                    let columns = columns([
                        (bgp_route::BGP_ROUTER, Value::Ref(router.id())),
                        (bgp_route::PREFIX, Value::text(route.prefix.to_string())),
                        (bgp_route::PEER, Value::text(route.peer.to_string())),
                        (bgp_route::METRIC, Value::from(route.metric)),
                        (bgp_route::SELECTED, Value::from(route.selected)),
                        (bgp_route::PATH_ATTRIBUTES, attributes),
                    ]);
                    self.insert(Table::BgpRoute, Some(key), columns)?;
                }
                debug!(asn, prefix = %route.prefix, "published BGP route");
            }
            ProtocolEvent::BgpRouteSelected {
                asn,
                prefix,
                selected,
            } => {
                let target = self.bgp_route(*asn, *prefix)?;
                self.set(&target, bgp_route::SELECTED, Value::from(*selected))?;
            }
            ProtocolEvent::BgpRouteAnnounced { asn, prefix } => {
                let target = self.bgp_route(*asn, *prefix)?;
                self.set(&target, bgp_route::RIB_STATE, Value::text("announce"))?;
            }
            ProtocolEvent::BgpRouteWithdrawn { asn, prefix } => {
                let target = self.bgp_route(*asn, *prefix)?;
                self.set(&target, bgp_route::RIB_STATE, Value::text("withdraw"))?;
            }
            ProtocolEvent::BgpRouteDeleted { asn, prefix } => {
                let target = self.bgp_route(*asn, *prefix)?;
                self.remove(&target)?;
            }
            ProtocolEvent::BgpNeighborStateChanged {
                asn,
                neighbor,
                state,
            } => self.neighbor_state(*asn, *neighbor, *state)?,
            ProtocolEvent::OspfInterfaceStateChanged { interface, state } => {
                let iface = self.interface(interface)?;
                self.set(&iface, ospf_interface::STATE, Value::text(state))?;
            }
            ProtocolEvent::OspfNeighborStateChanged {
                interface,
                neighbor,
            } => {
                let iface = self.interface(interface)?;
                let key = RowKey::OspfNeighbor(interface.clone(), neighbor.router_id);
                let priority = Value::from(i64::from(neighbor.priority));
                if let Some(target) = self.lookup(&key) {
                    self.set(
                        &target,
                        ospf_neighbor::NBR_IF_ADDR,
                        Value::text(neighbor.if_addr.to_string()),
                    )?;
                    self.set(&target, ospf_neighbor::STATE, Value::text(&neighbor.state))?;
                    self.set(&target, ospf_neighbor::PRIORITY, priority)?;
                } else {
                    let columns = columns([
                        (ospf_neighbor::INTERFACE, Value::text(interface)),
                        (
                            ospf_neighbor::NBR_ROUTER_ID,
                            Value::text(neighbor.router_id.to_string()),
                        ),
                        (
                            ospf_neighbor::NBR_IF_ADDR,
                            Value::text(neighbor.if_addr.to_string()),
                        ),
                        (ospf_neighbor::STATE, Value::text(&neighbor.state)),
                        (ospf_neighbor::PRIORITY, priority),
                    ]);
                    let id = self.insert(Table::OspfNeighbor, Some(key), columns)?;
                    let mut refs = self
                        .value(Table::OspfInterface, iface.id(), ospf_interface::NEIGHBORS)
                        .refs();
                    refs.push(id);
                    self.set(&iface, ospf_interface::NEIGHBORS, Value::ref_list(refs))?;
                }
            }
            ProtocolEvent::OspfNeighborRemoved {
                interface,
                router_id,
            } => {
                let iface = self.interface(interface)?;
                let target = self
                    .lookup(&RowKey::OspfNeighbor(interface.clone(), *router_id))
                    .ok_or_else(|| {
                        let key = format!("{interface}/{router_id}");
                        EngineError::missing(Table::OspfNeighbor, key)
                    })?;
                let gone = target.id();
                self.remove(&target)?;
                let mut refs = self
                    .value(Table::OspfInterface, iface.id(), ospf_interface::NEIGHBORS)
                    .refs();
                refs.retain(|id| *id != gone);
                self.set(&iface, ospf_interface::NEIGHBORS, Value::ref_list(refs))?;
            }
            ProtocolEvent::OspfLsaAdded {
                instance_tag,
                area_id,
                lsa,
            } => {
                let area = self.area(instance_tag, *area_id)?;
                let key = RowKey::Lsa(instance_tag.clone(), *area_id, lsa.key);
                let seq_num = Value::from(lsa.seq_num);
                let checksum = Value::from(i64::from(lsa.checksum));
                if let Some(target) = self.lookup(&key) {
                    self.set(&target, ospf_lsa::LS_SEQ_NUM, seq_num)?;
                    self.set(&target, ospf_lsa::CHKSUM, checksum)?;
                } else {
                    let columns = columns([
                        (ospf_lsa::INSTANCE_TAG, Value::text(instance_tag)),
                        (ospf_lsa::AREA_ID, Value::text(area_id.to_string())),
                        (ospf_lsa::LSA_TYPE, Value::text(lsa.key.lsa_type.as_str())),
                        (ospf_lsa::LS_ID, Value::text(lsa.key.ls_id.to_string())),
                        (ospf_lsa::ADV_ROUTER, Value::text(lsa.key.adv_router.to_string())),
                        (ospf_lsa::LS_SEQ_NUM, seq_num),
                        (ospf_lsa::CHKSUM, checksum),
                    ]);
                    let id = self.insert(Table::OspfLsa, Some(key), columns)?;
                    let list = lsa_list(lsa.key.lsa_type);
                    let mut refs = self.value(Table::OspfArea, area.id(), list).refs();
                    refs.push(id);
                    self.set(&area, list, Value::ref_list(refs))?;
                }
                self.refresh_checksum(&area)?;
            }
            ProtocolEvent::OspfLsaRemoved {
                instance_tag,
                area_id,
                key,
            } => {
                let area = self.area(instance_tag, *area_id)?;
                let target = self
                    .lookup(&RowKey::Lsa(instance_tag.clone(), *area_id, *key))
                    .ok_or_else(|| {
                        EngineError::missing(
                            Table::OspfLsa,
                            format!(
                                "{instance_tag}/{area_id}/{}/{}/{}",
                                key.lsa_type.as_str(),
                                key.ls_id,
                                key.adv_router
                            ),
                        )
                    })?;
                let gone = target.id();
                self.remove(&target)?;
                let list = lsa_list(key.lsa_type);
                let mut refs = self.value(Table::OspfArea, area.id(), list).refs();
                refs.retain(|id| *id != gone);
                self.set(&area, list, Value::ref_list(refs))?;
                self.refresh_checksum(&area)?;
            }
            ProtocolEvent::OspfSpfCompleted {
                instance_tag,
                area_id,
                routes,
            } => {
                let area = self.area(instance_tag, *area_id)?;
                let old = self
                    .value(Table::OspfArea, area.id(), ospf_area::OSPF_ROUTES)
                    .refs();
                for id in &old {
                    let target = match self.snapshot.get(Table::OspfRoute, *id) {
                        Some(row) if !self.removed.contains(id) => Target::Stored(Arc::clone(row)),
                        Some(_) => continue,
                        None if self.values.contains_key(id) => Target::Staged(*id),
                        None => continue,
                    };
                    self.remove(&target)?;
                }
                let mut ids = Vec::with_capacity(routes.len());
                for r in routes {
                    let nexthops = Value::text_list(r.nexthops.iter().map(ToString::to_string));
                    let columns = columns([
                        (ospf_route::PREFIX, Value::text(r.prefix.to_string())),
                        (ospf_route::PATH_TYPE, Value::text(&r.path_type)),
                        (ospf_route::COST, Value::from(r.cost)),
                        (ospf_route::NEXTHOPS, nexthops),
                    ]);
                    ids.push(self.insert(Table::OspfRoute, None, columns)?);
                }
                self.set(&area, ospf_area::OSPF_ROUTES, Value::ref_list(ids))?;
                let runs = self
                    .value(Table::OspfArea, area.id(), ospf_area::SPF_CALC_COUNT)
                    .as_integer()
                    .unwrap_or(0);
                self.set(&area, ospf_area::SPF_CALC_COUNT, Value::from(runs + 1))?;
                debug!(
                    tag = %instance_tag,
                    area = %area_id,
                    old = old.len(),
                    new = routes.len(),
                    "republished SPF routes"
                );
            }
            ProtocolEvent::RibRouteSelected {
                prefix,
                from,
                selected,
            } => {
                let row = self.parent(
                    self.index.route(*prefix, from),
                    Table::Route,
                    format!("{prefix} from {from}"),
                )?;
                self.set(&row, route::SELECTED, Value::from(*selected))?;
            }
        }
        Ok(())
    }

    fn bgp_route(&self, asn: u32, prefix: Prefix) -> EngineResult<Target> {
        self.lookup(&RowKey::BgpRoute(asn, prefix))
            .ok_or_else(|| EngineError::missing(Table::BgpRoute, format!("{asn}/{prefix}")))
    }

    fn interface(&self, name: &str) -> EngineResult<Target> {
        self.parent(self.index.ospf_interface(name), Table::OspfInterface, name)
    }

    fn area(&self, tag: &str, area_id: Ipv4Addr) -> EngineResult<Target> {
        self.parent(
            self.index.ospf_area(tag, area_id),
            Table::OspfArea,
            format!("{tag}/{area_id}"),
        )
    }

    fn neighbor_state(
        &mut self,
        asn: u32,
        address: std::net::IpAddr,
        state: BgpPeerState,
    ) -> EngineResult<()> {
        let row = self.parent(
            self.index.bgp_neighbor(asn, address),
            Table::BgpNeighbor,
            format!("{asn}/{address}"),
        )?;
        let id = row.id();
        let mut status = self
            .value(Table::BgpNeighbor, id, bgp_neighbor::STATUS)
            .as_map()
            .cloned()
            .unwrap_or_default();
        let previous = status
            .get(bgp_neighbor::STATUS_PEER_STATE)
            .and_then(Value::as_text)
            .map(str::to_string);
        status.insert(
            bgp_neighbor::STATUS_PEER_STATE.to_string(),
            Value::text(state.as_str()),
        );
        self.set(&row, bgp_neighbor::STATUS, Value::Map(status))?;

        let established = BgpPeerState::Established.as_str();
        if state == BgpPeerState::Established && previous.as_deref() != Some(established) {
            let mut stats = self
                .value(Table::BgpNeighbor, id, bgp_neighbor::STATISTICS)
                .as_map()
                .cloned()
                .unwrap_or_default();
            let count = stats
                .get(bgp_neighbor::STAT_ESTABLISHED_COUNT)
                .and_then(Value::as_integer)
                .unwrap_or(0);
            stats.insert(
                bgp_neighbor::STAT_ESTABLISHED_COUNT.to_string(),
                Value::from(count + 1),
            );
            self.set(&row, bgp_neighbor::STATISTICS, Value::Map(stats))?;
        }
        debug!(asn, neighbor = %address, %state, "published peer state");
        Ok(())
    }

    /// Recomputes the area's aggregate checksum over the LSAs it lists.
    fn refresh_checksum(&mut self, area: &Target) -> EngineResult<()> {
        let mut sum: u32 = 0;
        for list in [ospf_area::ROUTER_LSAS, ospf_area::NETWORK_LSAS] {
            for lsa in self.value(Table::OspfArea, area.id(), list).refs() {
                let checksum = self
                    .value(Table::OspfLsa, lsa, ospf_lsa::CHKSUM)
                    .as_integer()
                    .and_then(|c| u32::try_from(c).ok())
                    .unwrap_or(0);
                sum = sum.wrapping_add(checksum);
            }
        }
        self.set(area, ospf_area::LSA_CHECKSUM_SUM, Value::from(sum))
    }
}

fn lsa_list(lsa_type: LsaType) -> &'static str {
    match lsa_type {
        LsaType::Router => ospf_area::ROUTER_LSAS,
        LsaType::Network => ospf_area::NETWORK_LSAS,
    }
}

fn columns<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::runtime::{BgpRouteInfo, LsaInfo, OspfNeighborInfo, OspfRouteInfo};
    use rtsync_store::columns::{bgp_router, ospf_router};
    use rtsync_store::{MemoryStore, StoreClient};

    struct Fixture {
        store: Arc<MemoryStore>,
        coord: TransactionCoordinator,
        publisher: StatePublisher,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let coord = TransactionCoordinator::new(
                Arc::clone(&store) as Arc<dyn StoreClient>,
                RetryConfig::no_backoff(),
            );
            Self {
                store,
                coord,
                publisher: StatePublisher::new(),
            }
        }

        fn insert<const N: usize>(&self, table: Table, pairs: [(&str, Value); N]) -> RowId {
            let mut txn = self.store.begin().unwrap();
            let id = txn.insert(table, columns(pairs)).unwrap();
            assert_eq!(self.store.commit(txn), CommitStatus::Success);
            id
        }

        fn row(&self, table: Table, id: RowId) -> Arc<Row> {
            Arc::clone(self.store.snapshot().get(table, id).unwrap())
        }

        fn publish(&mut self, event: ProtocolEvent) -> EngineResult<PublishOutcome> {
            self.publisher.publish(&mut self.coord, event)
        }

        fn bgp(&self) -> RowId {
            let router = self.insert(Table::BgpRouter, [(bgp_router::ASN, Value::from(65001i64))]);
            self.insert(
                Table::BgpNeighbor,
                [
                    (bgp_neighbor::BGP_ROUTER, Value::Ref(router)),
                    (bgp_neighbor::IP_ADDRESS, Value::text("10.0.0.2")),
                    (bgp_neighbor::REMOTE_AS, Value::from(65002i64)),
                ],
            )
        }

        fn ospf_area(&self) -> RowId {
            let area = self.insert(Table::OspfArea, [(ospf_area::AREA_ID, Value::text("0.0.0.0"))]);
            self.insert(
                Table::OspfRouter,
                [
                    (ospf_router::INSTANCE_TAG, Value::text("core")),
                    (ospf_router::AREAS, Value::map([("0.0.0.0", Value::Ref(area))])),
                ],
            );
            area
        }
    }

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn route_added(prefix: &str, selected: bool) -> ProtocolEvent {
        ProtocolEvent::BgpRouteAdded {
            asn: 65001,
            route: BgpRouteInfo {
                prefix: p(prefix),
                peer: "10.0.0.2".parse().unwrap(),
                metric: 10,
                selected,
                path_attributes: BTreeMap::from([("origin".to_string(), "igp".to_string())]),
            },
        }
    }

    fn lsa(ls_id: &str, checksum: u16) -> LsaInfo {
        LsaInfo {
            key: LsaKey {
                lsa_type: LsaType::Router,
                ls_id: ls_id.parse().unwrap(),
                adv_router: ls_id.parse().unwrap(),
            },
            seq_num: 0x8000_0001,
            checksum,
        }
    }

    #[test]
    fn route_rows_follow_events() {
        let mut f = Fixture::new();
        f.bgp();
        assert_eq!(f.publish(route_added("10.1.0.0/16", true)).unwrap(), PublishOutcome::Applied);

        let snapshot = f.store.snapshot();
        let row = snapshot.rows(Table::BgpRoute).next().unwrap();
        assert_eq!(row.text(bgp_route::PREFIX), Some("10.1.0.0/16"));
        assert_eq!(row.boolean(bgp_route::SELECTED), Some(true));

        f.publish(ProtocolEvent::BgpRouteAnnounced {
            asn: 65001,
            prefix: p("10.1.0.0/16"),
        })
        .unwrap();
        let row = f.row(Table::BgpRoute, row.id());
        assert_eq!(row.text(bgp_route::RIB_STATE), Some("announce"));

        f.publish(ProtocolEvent::BgpRouteDeleted {
            asn: 65001,
            prefix: p("10.1.0.0/16"),
        })
        .unwrap();
        assert!(f.store.snapshot().is_empty(Table::BgpRoute));
    }

    #[test]
    fn withdraw_while_selected_fails_without_a_transaction() {
        let mut f = Fixture::new();
        f.bgp();
        f.publish(route_added("10.1.0.0/16", true)).unwrap();
        let seq = f.store.sequence_number();
        let begun = f.coord.stats().begun;

        let err = f
            .publish(ProtocolEvent::BgpRouteWithdrawn {
                asn: 65001,
                prefix: p("10.1.0.0/16"),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::RouteStateViolation { selected: true, .. }));
        assert_eq!(f.store.sequence_number(), seq);
        assert_eq!(f.coord.stats().begun, begun);
        assert_eq!(f.publisher.stats().dropped, 1);
    }

    #[test]
    fn batch_sees_its_own_selection() {
        let mut f = Fixture::new();
        f.bgp();
        let outcome = f
            .publisher
            .publish_batch(
                &mut f.coord,
                vec![
                    route_added("10.1.0.0/16", false),
                    ProtocolEvent::BgpRouteSelected {
                        asn: 65001,
                        prefix: p("10.1.0.0/16"),
                        selected: true,
                    },
                    ProtocolEvent::BgpRouteAnnounced {
                        asn: 65001,
                        prefix: p("10.1.0.0/16"),
                    },
                ],
            )
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Applied);
        let snapshot = f.store.snapshot();
        let row = snapshot.rows(Table::BgpRoute).next().unwrap();
        assert_eq!(row.boolean(bgp_route::SELECTED), Some(true));
        assert_eq!(row.text(bgp_route::RIB_STATE), Some("announce"));
    }

    #[test]
    fn missing_parent_never_creates_configuration() {
        let mut f = Fixture::new();
        let err = f.publish(route_added("10.1.0.0/16", true)).unwrap_err();
        assert!(matches!(err, EngineError::MissingRow { table: Table::BgpRouter, .. }));
        let snapshot = f.store.snapshot();
        assert!(snapshot.is_empty(Table::BgpRouter));
        assert!(snapshot.is_empty(Table::BgpRoute));
        assert!(!f.coord.is_open());
    }

    #[test]
    fn established_count_increments_on_entry() {
        let mut f = Fixture::new();
        let neighbor = f.bgp();
        for state in [
            BgpPeerState::Connect,
            BgpPeerState::Established,
            BgpPeerState::Established,
            BgpPeerState::Idle,
            BgpPeerState::Established,
        ] {
            f.publish(ProtocolEvent::BgpNeighborStateChanged {
                asn: 65001,
                neighbor: "10.0.0.2".parse().unwrap(),
                state,
            })
            .unwrap();
        }
        let row = f.row(Table::BgpNeighbor, neighbor);
        let status = row.get(bgp_neighbor::STATUS).as_map().unwrap();
        assert_eq!(
            status.get(bgp_neighbor::STATUS_PEER_STATE),
            Some(&Value::text("established"))
        );
        let stats = row.get(bgp_neighbor::STATISTICS).as_map().unwrap();
        assert_eq!(
            stats.get(bgp_neighbor::STAT_ESTABLISHED_COUNT),
            Some(&Value::from(2i64))
        );
    }

    #[test]
    fn ospf_neighbors_are_listed_on_the_interface() {
        let mut f = Fixture::new();
        let iface = f.insert(Table::OspfInterface, [(ospf_interface::NAME, Value::text("eth0"))]);
        let neighbor = |state: &str| ProtocolEvent::OspfNeighborStateChanged {
            interface: "eth0".into(),
            neighbor: OspfNeighborInfo {
                router_id: "2.2.2.2".parse().unwrap(),
                if_addr: "10.0.0.2".parse().unwrap(),
                state: state.into(),
                priority: 1,
            },
        };
        f.publish(neighbor("init")).unwrap();
        f.publish(neighbor("full")).unwrap();

        let snapshot = f.store.snapshot();
        assert_eq!(snapshot.row_count(Table::OspfNeighbor), 1);
        let nbr = snapshot.rows(Table::OspfNeighbor).next().unwrap();
        assert_eq!(nbr.text(ospf_neighbor::STATE), Some("full"));
        let neighbors = f.row(Table::OspfInterface, iface).get(ospf_interface::NEIGHBORS).refs();
        assert_eq!(neighbors, vec![nbr.id()]);

        f.publish(ProtocolEvent::OspfNeighborRemoved {
            interface: "eth0".into(),
            router_id: "2.2.2.2".parse().unwrap(),
        })
        .unwrap();
        assert!(f.store.snapshot().is_empty(Table::OspfNeighbor));
        let neighbors = f.row(Table::OspfInterface, iface).get(ospf_interface::NEIGHBORS).refs();
        assert!(neighbors.is_empty());
    }

    #[test]
    fn lsa_lists_and_checksum_follow_add_and_remove() {
        let mut f = Fixture::new();
        let area = f.ospf_area();
        let added = |l: LsaInfo| ProtocolEvent::OspfLsaAdded {
            instance_tag: "core".into(),
            area_id: Ipv4Addr::UNSPECIFIED,
            lsa: l,
        };
        f.publish(added(lsa("1.1.1.1", 0xffff))).unwrap();
        f.publish(added(lsa("2.2.2.2", 0x0002))).unwrap();

        let row = f.row(Table::OspfArea, area);
        assert_eq!(row.get(ospf_area::ROUTER_LSAS).refs().len(), 2);
        assert_eq!(row.integer(ospf_area::LSA_CHECKSUM_SUM), Some(0x1_0001));

        f.publish(ProtocolEvent::OspfLsaRemoved {
            instance_tag: "core".into(),
            area_id: Ipv4Addr::UNSPECIFIED,
            key: lsa("1.1.1.1", 0).key,
        })
        .unwrap();
        let row = f.row(Table::OspfArea, area);
        assert_eq!(row.get(ospf_area::ROUTER_LSAS).refs().len(), 1);
        assert_eq!(row.integer(ospf_area::LSA_CHECKSUM_SUM), Some(2));
        assert_eq!(f.store.snapshot().row_count(Table::OspfLsa), 1);
    }

    #[test]
    fn spf_republish_is_one_commit() {
        let mut f = Fixture::new();
        let area = f.ospf_area();
        let spf = |prefixes: &[&str]| ProtocolEvent::OspfSpfCompleted {
            instance_tag: "core".into(),
            area_id: Ipv4Addr::UNSPECIFIED,
            routes: prefixes
                .iter()
                .map(|s| OspfRouteInfo {
                    prefix: p(s),
                    path_type: "intra_area".into(),
                    cost: 10,
                    nexthops: vec!["10.0.0.2".parse().unwrap()],
                })
                .collect(),
        };
        f.publish(spf(&["10.1.0.0/16", "10.2.0.0/16", "10.3.0.0/16"])).unwrap();
        let before = f.store.sequence_number();

        f.publish(spf(&["10.4.0.0/16", "10.5.0.0/16"])).unwrap();
        assert_eq!(f.store.sequence_number().as_u64(), before.as_u64() + 1);

        let snapshot = f.store.snapshot();
        assert_eq!(snapshot.row_count(Table::OspfRoute), 2);
        let row = f.row(Table::OspfArea, area);
        assert_eq!(row.get(ospf_area::OSPF_ROUTES).refs().len(), 2);
        assert_eq!(row.integer(ospf_area::SPF_CALC_COUNT), Some(2));
    }

    #[test]
    fn contended_commit_is_requeued_and_flushed_later() {
        let mut f = Fixture::new();
        f.bgp();
        f.publisher.enqueue(route_added("10.1.0.0/16", true));
        f.store.inject_commit_status(CommitStatus::Contended);

        let report = f.publisher.flush(&mut f.coord);
        assert_eq!(report.requeued, 1);
        assert_eq!(f.publisher.queued(), 1);

        let report = f.publisher.flush(&mut f.coord);
        assert_eq!(report.published, 1);
        assert_eq!(f.publisher.queued(), 0);
        assert_eq!(f.store.snapshot().row_count(Table::BgpRoute), 1);
    }

    #[test]
    fn incomplete_commit_holds_the_queue() {
        let mut f = Fixture::new();
        f.bgp();
        f.store.defer_commits(true);
        f.publisher.enqueue(route_added("10.1.0.0/16", false));
        f.publisher.enqueue(ProtocolEvent::BgpRouteSelected {
            asn: 65001,
            prefix: p("10.1.0.0/16"),
            selected: true,
        });

        let report = f.publisher.flush(&mut f.coord);
        assert_eq!(report.pending, 1);
        assert_eq!(f.publisher.awaiting(), 1);
        assert_eq!(f.publisher.queued(), 1);

        f.store.defer_commits(false);
        f.store.run().unwrap();
        let resolved = f.coord.poll_in_flight();
        f.publisher.resolve(&resolved);
        assert_eq!(f.publisher.awaiting(), 0);

        let report = f.publisher.flush(&mut f.coord);
        assert_eq!(report.published, 1);
        let snapshot = f.store.snapshot();
        let row = snapshot.rows(Table::BgpRoute).next().unwrap();
        assert_eq!(row.boolean(bgp_route::SELECTED), Some(true));
    }

    #[test]
    fn rib_selection_updates_route_rows() {
        let mut f = Fixture::new();
        let id = f.insert(
            Table::Route,
            [
                (route::PREFIX, Value::text("10.9.0.0/16")),
                (route::FROM, Value::text("static")),
            ],
        );
        f.publish(ProtocolEvent::RibRouteSelected {
            prefix: p("10.9.0.0/16"),
            from: "static".into(),
            selected: true,
        })
        .unwrap();
        assert_eq!(f.row(Table::Route, id).boolean(route::SELECTED), Some(true));
    }
}
