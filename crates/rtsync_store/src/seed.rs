//! JSON seed documents for the in-memory store.
//!
//! A seed document lists rows with their table, an optional fixed ID (so
//! that other rows can reference them) and their column values:
//!
//! ```json
//! {
//!   "rows": [
//!     { "table": "System", "columns": { "cur_cfg": { "integer": 1 } } },
//!     { "table": "BGP_Router",
//!       "id": "9a1f3f0e-46a1-4c1e-8a0e-3bb1f0a7e001",
//!       "columns": { "asn": { "integer": 65001 } } }
//!   ]
//! }
//! ```

use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryStore;
use crate::row::Row;
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::types::{RowId, SequenceNumber};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

/// One row of a seed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    /// Table of the row.
    pub table: Table,
    /// Fixed row ID; a random one is assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    /// Column values.
    #[serde(default)]
    pub columns: BTreeMap<String, Value>,
}

/// The initial contents of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    /// Rows, inserted in order.
    #[serde(default)]
    pub rows: Vec<SeedRow>,
}

impl SeedDocument {
    /// Reads a seed document from a JSON file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes the document as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Captures the live rows of a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let rows = Table::ALL
            .iter()
            .flat_map(|table| snapshot.rows(*table))
            .map(|row| SeedRow {
                table: row.table(),
                id: Some(row.id()),
                columns: row.columns().clone(),
            })
            .collect();
        Self { rows }
    }

    /// Builds a store holding the document's rows in one initial commit.
    ///
    /// Every reference must point to a row of the document.
    pub fn into_store(self) -> StoreResult<MemoryStore> {
        let mut ids = HashSet::new();
        let rows: Vec<(RowId, SeedRow)> = self
            .rows
            .into_iter()
            .map(|row| {
                let id = row.id.unwrap_or_default();
                if !ids.insert(id) {
                    return Err(StoreError::invalid_seed(format!("duplicate row id {id:?}")));
                }
                Ok((id, row))
            })
            .collect::<StoreResult<_>>()?;

        for (_, row) in &rows {
            for (column, value) in &row.columns {
                check_refs(value, &ids).map_err(|missing| {
                    StoreError::invalid_seed(format!(
                        "{}.{column} references unknown row {missing:?}",
                        row.table
                    ))
                })?;
            }
        }

        let seq = if rows.is_empty() {
            SequenceNumber::ZERO
        } else {
            SequenceNumber::new(1)
        };
        let mut snapshot = Snapshot::empty().advance(seq);
        let count = rows.len();
        for (id, row) in rows {
            let columns = row
                .columns
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect();
            snapshot.put_row(Row::new(id, row.table, columns, seq));
        }
        info!(rows = count, "store seeded");
        Ok(MemoryStore::with_snapshot(snapshot))
    }
}

fn check_refs(value: &Value, ids: &HashSet<RowId>) -> Result<(), RowId> {
    match value {
        Value::Ref(id) if !ids.contains(id) => Err(*id),
        Value::List(items) => items.iter().try_for_each(|v| check_refs(v, ids)),
        Value::Map(map) => map.values().try_for_each(|v| check_refs(v, ids)),
        _ => Ok(()),
    }
}
