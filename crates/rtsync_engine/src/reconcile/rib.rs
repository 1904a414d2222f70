//! RIB reconciler: static `Route` rows.
//!
//! Only rows with `from = "static"` are configuration. A row that switches
//! its `from` column to or away from `static` is installed or uninstalled
//! as if it had been inserted or deleted.

use super::{Domain, PassInput, ReconcileResult, Reconciler, Unsynced};
use crate::change::ChangeRecord;
use crate::error::EngineResult;
use crate::fields;
use crate::prefix::Prefix;
use crate::runtime::{ProtocolRuntime, StaticRoute};
use rtsync_store::columns::route;
use rtsync_store::{Row, RowId, Table};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const DEFAULT_DISTANCE: u8 = 1;
const DEFAULT_METRIC: u32 = 0;

fn is_static(row: &Row) -> bool {
    row.text(route::FROM) == Some(route::FROM_STATIC)
}

fn parse(row: &Row) -> EngineResult<StaticRoute> {
    Ok(StaticRoute {
        prefix: fields::prefix(row, route::PREFIX)?,
        nexthops: fields::ip_list(row, route::NEXTHOPS)?,
        distance: fields::optional_u8(row, route::DISTANCE)?.unwrap_or(DEFAULT_DISTANCE),
        metric: fields::optional_u32(row, route::METRIC)?.unwrap_or(DEFAULT_METRIC),
    })
}

/// Keeps static routes in line with their rows.
#[derive(Debug)]
pub struct RibReconciler {
    routes: HashMap<RowId, Prefix>,
    unsynced: Unsynced,
}

impl Default for RibReconciler {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            unsynced: Unsynced::new(Table::Route),
        }
    }
}

impl RibReconciler {
    /// Creates a reconciler with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn uninstall_all(&mut self, runtime: &mut dyn ProtocolRuntime, result: &mut ReconcileResult) {
        let prefixes = runtime.static_routes();
        for prefix in &prefixes {
            match runtime.uninstall_static_route(prefix) {
                Ok(()) => result.destroyed += 1,
                Err(e) => warn!(%prefix, error = %e, "static route teardown failed"),
            }
        }
        if !prefixes.is_empty() {
            info!(routes = prefixes.len(), "no static routes configured, uninstalled all");
        }
        self.routes.clear();
    }

    fn uninstall(
        &mut self,
        row_id: RowId,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(prefix) = self.routes.remove(&row_id) else {
            result.skipped += 1;
            return Ok(());
        };
        if runtime.static_route(&prefix).is_none() {
            result.skipped += 1;
            return Ok(());
        }
        runtime.uninstall_static_route(&prefix)?;
        debug!(%prefix, "uninstalled static route");
        result.destroyed += 1;
        Ok(())
    }

    fn install(
        &mut self,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let spec = parse(row)?;
        let prefix = spec.prefix;
        runtime.install_static_route(spec)?;
        self.routes.insert(row.id(), prefix);
        debug!(%prefix, "installed static route");
        result.created += 1;
        Ok(())
    }

    /// Brings the route of `row` in line with its full current value.
    fn initialize(
        &mut self,
        row: &Row,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let bound = self.routes.get(&row.id()).copied();
        if !is_static(row) {
            if bound.is_some() {
                self.uninstall(row.id(), runtime, result)?;
            }
            return Ok(());
        }
        let Some(prefix) = bound else {
            return self.install(row, runtime, result);
        };
        let spec = parse(row)?;
        if spec.prefix != prefix || runtime.static_route(&prefix).is_none() {
            self.uninstall(row.id(), runtime, result)?;
            return self.install(row, runtime, result);
        }
        runtime.set_static_nexthops(&prefix, spec.nexthops)?;
        runtime.set_static_distance(&prefix, spec.distance)?;
        runtime.set_static_metric(&prefix, spec.metric)?;
        debug!(%prefix, "re-initialized static route");
        result.updated += 1;
        Ok(())
    }

    fn modify(
        &mut self,
        rec: &ChangeRecord,
        runtime: &mut dyn ProtocolRuntime,
        result: &mut ReconcileResult,
    ) -> EngineResult<()> {
        let Some(prefix) = self.routes.get(&rec.row_id).copied() else {
            return Ok(());
        };
        if !is_static(&rec.row) {
            return self.uninstall(rec.row_id, runtime, result);
        }

        let spec = parse(&rec.row)?;
        if spec.prefix != prefix {
            self.uninstall(rec.row_id, runtime, result)?;
            return self.install(&rec.row, runtime, result);
        }
        if runtime.static_route(&prefix).is_none() {
            result.skipped += 1;
            return Ok(());
        }

        let mut touched = false;
        if rec.changed(route::NEXTHOPS) {
            runtime.set_static_nexthops(&prefix, spec.nexthops)?;
            touched = true;
        }
        if rec.changed(route::DISTANCE) {
            runtime.set_static_distance(&prefix, spec.distance)?;
            touched = true;
        }
        if rec.changed(route::METRIC) {
            runtime.set_static_metric(&prefix, spec.metric)?;
            touched = true;
        }
        if touched {
            debug!(%prefix, columns = ?rec.changed_columns, "updated static route");
            result.updated += 1;
        }
        Ok(())
    }
}

impl Reconciler for RibReconciler {
    fn domain(&self) -> Domain {
        Domain::Rib
    }

    fn apply(
        &mut self,
        input: &PassInput<'_>,
        runtime: &mut dyn ProtocolRuntime,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        if input.index.static_route_count() == 0 {
            self.uninstall_all(runtime, &mut result);
            return result;
        }
        let changes = input.changes;

        for rec in changes.deleted(Table::Route) {
            self.unsynced.remove(rec.row_id);
            if self.routes.contains_key(&rec.row_id) {
                if let Err(e) = self.uninstall(rec.row_id, runtime, &mut result) {
                    result.fail(rec.table, rec.row_id, e);
                }
            }
        }

        let attempts = self
            .unsynced
            .attempts(input, |id| self.routes.contains_key(&id));
        for attempt in &attempts {
            match self.initialize(&attempt.row, runtime, &mut result) {
                Ok(()) => self.unsynced.remove(attempt.row.id()),
                Err(e) => {
                    self.unsynced.insert(attempt.row.id());
                    result.fail_attempt(attempt, e);
                }
            }
        }

        let initialized: HashSet<RowId> = attempts.iter().map(|a| a.row.id()).collect();
        for rec in changes.modified(Table::Route) {
            if initialized.contains(&rec.row_id) {
                continue;
            }
            if let Err(e) = self.modify(rec, runtime, &mut result) {
                self.unsynced.insert(rec.row_id);
                result.fail(rec.table, rec.row_id, e);
            }
        }
        result
    }

    fn pending_teardown(&self) -> usize {
        0
    }

    fn unsynced_rows(&self) -> usize {
        self.unsynced.len()
    }
}
