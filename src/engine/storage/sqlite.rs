// Weft Engine — Embedded SQLite storage backend
//
// Single-file store behind a connection mutex. The key/value surface lives
// in `weft_kv`; declared tables are created verbatim from their definitions,
// which are mirrored into `weft_tables` so a reopened store knows its column
// types again.
//
// All identifiers are validated before SQL composition (see
// `TableDefinition::validate`); values are always bound as parameters.

use super::{
    glob_match, now_ms, parse_order_by, ColumnType, QueryOptions, Row, StorageAdapter, StoredValue,
    StoredType, TableDefinition,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::expr::value::{as_number, is_truthy, to_display_string};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    defs: Mutex<HashMap<String, TableDefinition>>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS weft_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS weft_tables (
                name TEXT PRIMARY KEY,
                def TEXT NOT NULL
            );",
        )?;

        // Reload table definitions from a previous run.
        let mut defs = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT name, def FROM weft_tables")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for entry in rows {
                let (name, def_json) = entry?;
                if let Ok(def) = serde_json::from_str::<TableDefinition>(&def_json) {
                    defs.insert(name, def);
                }
            }
        }

        Ok(SqliteStorage { conn: Mutex::new(conn), defs: Mutex::new(defs) })
    }

    fn table_def(&self, table: &str) -> EngineResult<TableDefinition> {
        self.defs
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::backend(format!("unknown table '{table}'")))
    }
}

fn sql_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::String => "TEXT",
        ColumnType::Number => "REAL",
        ColumnType::Boolean => "INTEGER",
        ColumnType::Json => "TEXT",
        ColumnType::Timestamp => "INTEGER",
    }
}

/// Encode a JSON value for a typed column as a bindable SQLite value.
fn encode(t: ColumnType, v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    if v.is_null() {
        return Sql::Null;
    }
    match t {
        ColumnType::String => Sql::Text(to_display_string(v)),
        ColumnType::Number => as_number(v).map(Sql::Real).unwrap_or(Sql::Null),
        ColumnType::Boolean => Sql::Integer(if is_truthy(v) { 1 } else { 0 }),
        ColumnType::Json => Sql::Text(serde_json::to_string(v).unwrap_or_else(|_| "null".into())),
        ColumnType::Timestamp => as_number(v).map(|f| Sql::Integer(f as i64)).unwrap_or(Sql::Null),
    }
}

/// Decode a SQLite value back into its JSON form for a typed column.
fn decode(t: ColumnType, v: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match (t, v) {
        (_, Sql::Null) => Value::Null,
        (ColumnType::String, Sql::Text(s)) => Value::String(s),
        (ColumnType::Number, Sql::Real(f)) => crate::engine::expr::value::number(f),
        (ColumnType::Number, Sql::Integer(i)) => Value::from(i),
        (ColumnType::Boolean, Sql::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Json, Sql::Text(s)) => serde_json::from_str(&s).unwrap_or(Value::Null),
        (ColumnType::Timestamp, Sql::Integer(i)) => Value::from(i),
        // Tolerate drifted storage classes rather than dropping the value.
        (_, Sql::Text(s)) => Value::String(s),
        (_, Sql::Integer(i)) => Value::from(i),
        (_, Sql::Real(f)) => crate::engine::expr::value::number(f),
        (_, Sql::Blob(_)) => Value::Null,
    }
}

fn map_constraint(e: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return EngineError::Constraint(e.to_string());
        }
    }
    EngineError::Database(e)
}

/// Build `WHERE` SQL and its bound values from an equality filter.
/// Only declared columns participate; unknown filter keys are an error.
fn build_where(
    def: &TableDefinition,
    filter: &Row,
) -> EngineResult<(String, Vec<rusqlite::types::Value>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    for (key, val) in filter {
        let col = def
            .columns
            .iter()
            .find(|c| &c.name == key)
            .ok_or_else(|| EngineError::backend(format!("unknown column '{key}' in filter")))?;
        clauses.push(format!("{} = ?{}", col.name, binds.len() + 1));
        binds.push(encode(col.column_type, val));
    }
    Ok((format!(" WHERE {}", clauses.join(" AND ")), binds))
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get(&self, key: &str) -> EngineResult<Option<StoredValue>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT value, type, created_at, updated_at, expires_at FROM weft_kv WHERE key = ?1",
        )?;
        let found = stmt
            .query_row(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match found {
            None => Ok(None),
            Some((value_json, type_str, created_at, updated_at, expires_at)) => {
                if expires_at.map(|t| t <= now_ms()).unwrap_or(false) {
                    conn.execute("DELETE FROM weft_kv WHERE key = ?1", params![key])?;
                    return Ok(None);
                }
                Ok(Some(StoredValue {
                    value: serde_json::from_str(&value_json).unwrap_or(Value::Null),
                    value_type: StoredType::parse(&type_str).unwrap_or(StoredType::Json),
                    created_at,
                    updated_at,
                    expires_at,
                }))
            }
        }
    }

    async fn set(&self, key: &str, value: StoredValue) -> EngineResult<()> {
        let conn = self.conn.lock();
        let value_json = serde_json::to_string(&value.value)?;
        // Preserve created_at across overwrites of a live entry.
        conn.execute(
            "INSERT INTO weft_kv (key, value, type, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                type = excluded.type,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at,
                created_at = CASE
                    WHEN weft_kv.expires_at IS NOT NULL AND weft_kv.expires_at <= excluded.updated_at
                    THEN excluded.created_at ELSE weft_kv.created_at END",
            params![
                key,
                value_json,
                value.value_type.as_str(),
                value.created_at,
                now_ms(),
                value.expires_at
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let now = now_ms();
        conn.execute(
            "DELETE FROM weft_kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        let n = conn.execute("DELETE FROM weft_kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    async fn has(&self, key: &str) -> EngineResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self, glob: Option<&str>) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM weft_kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms()],
        )?;
        let mut stmt = conn.prepare("SELECT key FROM weft_kv")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter(|k| glob.map(|g| glob_match(g, k)).unwrap_or(true))
            .collect();
        Ok(keys)
    }

    async fn clear(&self) -> EngineResult<()> {
        self.conn.lock().execute("DELETE FROM weft_kv", [])?;
        Ok(())
    }

    async fn create_table(&self, def: &TableDefinition) -> EngineResult<()> {
        def.validate()?;
        let conn = self.conn.lock();

        let cols: Vec<String> = def
            .columns
            .iter()
            .map(|c| {
                let mut ddl = format!("{} {}", c.name, sql_type(c.column_type));
                if c.primary {
                    ddl.push_str(" PRIMARY KEY");
                }
                if c.unique {
                    ddl.push_str(" UNIQUE");
                }
                ddl
            })
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            def.name,
            cols.join(", ")
        ))?;

        for col in def.columns.iter().filter(|c| c.index && !c.primary && !c.unique) {
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({});",
                def.name, col.name, def.name, col.name
            ))?;
        }
        for idx in &def.indexes {
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({});",
                def.name,
                idx.join("_"),
                def.name,
                idx.join(", ")
            ))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO weft_tables (name, def) VALUES (?1, ?2)",
            params![def.name, serde_json::to_string(def)?],
        )?;
        self.defs.lock().insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn insert(&self, table: &str, row: Row) -> EngineResult<()> {
        let def = self.table_def(table)?;
        let conn = self.conn.lock();
        let mut names = Vec::new();
        let mut binds = Vec::new();
        for col in &def.columns {
            names.push(col.name.clone());
            let v = row.get(&col.name).cloned().unwrap_or(Value::Null);
            binds.push(encode(col.column_type, &v));
        }
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                def.name,
                names.join(", "),
                placeholders.join(", ")
            ),
            rusqlite::params_from_iter(binds),
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    async fn update(&self, table: &str, filter: &Row, patch: &Row) -> EngineResult<u64> {
        let def = self.table_def(table)?;
        let conn = self.conn.lock();
        let mut sets = Vec::new();
        let mut binds = Vec::new();
        for (key, val) in patch {
            let col = def
                .columns
                .iter()
                .find(|c| &c.name == key)
                .ok_or_else(|| EngineError::backend(format!("unknown column '{key}' in patch")))?;
            sets.push(format!("{} = ?{}", col.name, binds.len() + 1));
            binds.push(encode(col.column_type, val));
        }
        if sets.is_empty() {
            return Ok(0);
        }
        let mut clauses = Vec::new();
        for (key, val) in filter {
            let col = def
                .columns
                .iter()
                .find(|c| &c.name == key)
                .ok_or_else(|| EngineError::backend(format!("unknown column '{key}' in filter")))?;
            clauses.push(format!("{} = ?{}", col.name, binds.len() + 1));
            binds.push(encode(col.column_type, val));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let n = conn
            .execute(
                &format!("UPDATE {} SET {}{}", def.name, sets.join(", "), where_sql),
                rusqlite::params_from_iter(binds),
            )
            .map_err(map_constraint)?;
        Ok(n as u64)
    }

    async fn delete_rows(&self, table: &str, filter: &Row) -> EngineResult<u64> {
        let def = self.table_def(table)?;
        let conn = self.conn.lock();
        let (where_sql, binds) = build_where(&def, filter)?;
        let n = conn.execute(
            &format!("DELETE FROM {}{}", def.name, where_sql),
            rusqlite::params_from_iter(binds),
        )?;
        Ok(n as u64)
    }

    async fn query(&self, table: &str, opts: &QueryOptions) -> EngineResult<Vec<Row>> {
        let def = self.table_def(table)?;
        let conn = self.conn.lock();

        // Projection still reads full rows; narrowing happens after decode so
        // the column list in SQL never depends on caller input.
        let (where_sql, binds) = build_where(&def, &opts.filter)?;
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            def.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
            def.name,
            where_sql
        );
        if let Some(order) = &opts.order_by {
            let (col, desc) = parse_order_by(order)?;
            if !def.columns.iter().any(|c| c.name == col) {
                return Err(EngineError::backend(format!("unknown order column '{col}'")));
            }
            sql.push_str(&format!(" ORDER BY {} {}", col, if desc { "DESC" } else { "ASC" }));
        }
        if let Some(limit) = opts.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        } else if opts.offset.is_some() {
            sql.push_str(" LIMIT -1");
        }
        if let Some(offset) = opts.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds), |sql_row| {
            let mut row = Row::new();
            for (i, col) in def.columns.iter().enumerate() {
                let raw: rusqlite::types::Value = sql_row.get(i)?;
                row.insert(col.name.clone(), decode(col.column_type, raw));
            }
            Ok(row)
        })?;

        let mut out = Vec::new();
        for r in rows {
            let mut row = r?;
            if let Some(cols) = &opts.select {
                row.retain(|k, _| cols.iter().any(|c| c == k));
            }
            out.push(row);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn satisfies_storage_contract_in_memory() {
        let adapter = SqliteStorage::open_in_memory().unwrap();
        crate::engine::storage::contract::run(&adapter).await;
    }

    #[tokio::test]
    async fn satisfies_storage_contract_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqliteStorage::open(&dir.path().join("weft.db")).unwrap();
        crate::engine::storage::contract::run(&adapter).await;
    }

    #[tokio::test]
    async fn table_definitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.db");
        let def = TableDefinition {
            name: "notes".into(),
            columns: vec![super::super::ColumnDef {
                name: "body".into(),
                column_type: ColumnType::String,
                primary: false,
                unique: false,
                index: false,
            }],
            indexes: vec![],
        };
        {
            let adapter = SqliteStorage::open(&path).unwrap();
            adapter.create_table(&def).await.unwrap();
            let mut row = Row::new();
            row.insert("body".into(), Value::String("hello".into()));
            adapter.insert("notes", row).await.unwrap();
        }
        let adapter = SqliteStorage::open(&path).unwrap();
        let rows = adapter.query("notes", &QueryOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["body"], Value::String("hello".into()));
    }
}
