// Weft Engine — In-memory storage backend
//
// Map-of-maps reference backend. Used by default when the spec declares no
// persistent backend, and by the contract suite as the semantic baseline.

use super::{
    glob_match, now_ms, parse_order_by, QueryOptions, Row, StorageAdapter, StoredValue,
    TableDefinition,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::expr::value::{compare, loose_eq};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

struct Table {
    def: TableDefinition,
    rows: Vec<Row>,
}

#[derive(Default)]
pub struct MemoryStorage {
    kv: Mutex<HashMap<String, StoredValue>>,
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn row_matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(k, v)| row.get(k).map(|got| loose_eq(got, v)).unwrap_or(v.is_null()))
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> EngineResult<Option<StoredValue>> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(sv) if sv.is_expired(now_ms()) => {
                kv.remove(key);
                Ok(None)
            }
            Some(sv) => Ok(Some(sv.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, mut value: StoredValue) -> EngineResult<()> {
        let mut kv = self.kv.lock();
        if let Some(existing) = kv.get(key) {
            if !existing.is_expired(now_ms()) {
                value.created_at = existing.created_at;
            }
        }
        value.updated_at = now_ms();
        kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<bool> {
        let mut kv = self.kv.lock();
        match kv.remove(key) {
            Some(sv) => Ok(!sv.is_expired(now_ms())),
            None => Ok(false),
        }
    }

    async fn has(&self, key: &str) -> EngineResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self, glob: Option<&str>) -> EngineResult<Vec<String>> {
        let mut kv = self.kv.lock();
        let now = now_ms();
        kv.retain(|_, sv| !sv.is_expired(now));
        Ok(kv
            .keys()
            .filter(|k| glob.map(|g| glob_match(g, k)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> EngineResult<()> {
        self.kv.lock().clear();
        Ok(())
    }

    async fn create_table(&self, def: &TableDefinition) -> EngineResult<()> {
        def.validate()?;
        let mut tables = self.tables.lock();
        // Idempotent: keep existing rows if the table is already there.
        tables
            .entry(def.name.clone())
            .or_insert_with(|| Table { def: def.clone(), rows: Vec::new() });
        Ok(())
    }

    async fn insert(&self, table: &str, row: Row) -> EngineResult<()> {
        let mut tables = self.tables.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| EngineError::backend(format!("unknown table '{table}'")))?;
        for col in &t.def.columns {
            if !(col.primary || col.unique) {
                continue;
            }
            let candidate = row.get(&col.name).cloned().unwrap_or(Value::Null);
            if candidate.is_null() {
                continue;
            }
            let clash = t
                .rows
                .iter()
                .any(|r| r.get(&col.name).map(|v| loose_eq(v, &candidate)).unwrap_or(false));
            if clash {
                return Err(EngineError::Constraint(format!(
                    "duplicate value for '{}.{}'",
                    table, col.name
                )));
            }
        }
        t.rows.push(row);
        Ok(())
    }

    async fn update(&self, table: &str, filter: &Row, patch: &Row) -> EngineResult<u64> {
        let mut tables = self.tables.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| EngineError::backend(format!("unknown table '{table}'")))?;
        let mut count = 0;
        for row in t.rows.iter_mut() {
            if row_matches(row, filter) {
                for (k, v) in patch {
                    row.insert(k.clone(), v.clone());
                }
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_rows(&self, table: &str, filter: &Row) -> EngineResult<u64> {
        let mut tables = self.tables.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| EngineError::backend(format!("unknown table '{table}'")))?;
        let before = t.rows.len();
        t.rows.retain(|row| !row_matches(row, filter));
        Ok((before - t.rows.len()) as u64)
    }

    async fn query(&self, table: &str, opts: &QueryOptions) -> EngineResult<Vec<Row>> {
        let tables = self.tables.lock();
        let t = tables
            .get(table)
            .ok_or_else(|| EngineError::backend(format!("unknown table '{table}'")))?;
        let mut rows: Vec<Row> =
            t.rows.iter().filter(|r| row_matches(r, &opts.filter)).cloned().collect();
        if let Some(order) = &opts.order_by {
            let (col, desc) = parse_order_by(order)?;
            rows.sort_by(|a, b| {
                let x = a.get(&col).unwrap_or(&Value::Null);
                let y = b.get(&col).unwrap_or(&Value::Null);
                let ord = compare(x, y).unwrap_or(std::cmp::Ordering::Equal);
                if desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let offset = opts.offset.unwrap_or(0) as usize;
        let rows: Vec<Row> = rows
            .into_iter()
            .skip(offset)
            .take(opts.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .map(|mut row| {
                if let Some(cols) = &opts.select {
                    row.retain(|k, _| cols.iter().any(|c| c == k));
                }
                row
            })
            .collect();
        Ok(rows)
    }
}
