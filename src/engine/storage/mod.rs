// Weft Engine — Storage Adapter
//
// One contract, two surfaces: a key/value store with TTL, and typed tables
// with primary/unique/index constraints and filtered queries. Three backends
// satisfy the contract identically: in-memory (`memory`), embedded SQLite
// (`sqlite`), and networked Postgres (`postgres`, behind the feature gate).
// The shared contract suite at the bottom is run against each backend.
//
// TTL is lazy: an entry whose `expires_at` has passed is semantically absent
// and must be evicted on first observation (get/has/keys), never returned.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Stored values (key/value surface) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Json,
    Timestamp,
}

impl StoredType {
    /// Infer the stored type from a value (used when the spec does not
    /// declare one).
    pub fn infer(v: &Value) -> Self {
        match v {
            Value::Null => StoredType::Null,
            Value::Bool(_) => StoredType::Boolean,
            Value::Number(_) => StoredType::Number,
            Value::String(_) => StoredType::String,
            Value::Array(_) => StoredType::Array,
            Value::Object(_) => StoredType::Object,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "string" => StoredType::String,
            "number" => StoredType::Number,
            "boolean" => StoredType::Boolean,
            "object" => StoredType::Object,
            "array" => StoredType::Array,
            "null" => StoredType::Null,
            "json" => StoredType::Json,
            "timestamp" => StoredType::Timestamp,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoredType::String => "string",
            StoredType::Number => "number",
            StoredType::Boolean => "boolean",
            StoredType::Object => "object",
            StoredType::Array => "array",
            StoredType::Null => "null",
            StoredType::Json => "json",
            StoredType::Timestamp => "timestamp",
        }
    }
}

/// A value in the key/value store. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: StoredType,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredValue {
    pub fn new(value: Value) -> Self {
        let now = now_ms();
        let value_type = StoredType::infer(&value);
        StoredValue { value, value_type, created_at: now, updated_at: now, expires_at: None }
    }

    pub fn with_ttl(value: Value, ttl_ms: i64) -> Self {
        let mut sv = Self::new(value);
        sv.expires_at = Some(now_ms() + ttl_ms);
        sv
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

// ── Table definitions (tabular surface) ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Json,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

fn default_column_type() -> ColumnType {
    ColumnType::String
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Composite indexes over ordered column tuples.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

impl TableDefinition {
    /// Reject table/column names outside `[A-Za-z_][A-Za-z0-9_]*` before any
    /// backend query is composed from them.
    pub fn validate(&self) -> EngineResult<()> {
        validate_ident(&self.name)?;
        if self.columns.is_empty() {
            return Err(EngineError::normalization(format!("table '{}' has no columns", self.name)));
        }
        for col in &self.columns {
            validate_ident(&col.name)?;
        }
        for idx in &self.indexes {
            for col in idx {
                validate_ident(col)?;
            }
        }
        Ok(())
    }
}

/// A table row: declared column names to typed values.
pub type Row = Map<String, Value>;

/// Options for `query`: projection, equality filter, single-column ordering
/// with optional `ASC`/`DESC` suffix, limit and offset.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub filter: Row,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

// ── The adapter contract ───────────────────────────────────────────────────

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // Key/value surface.
    async fn get(&self, key: &str) -> EngineResult<Option<StoredValue>>;
    async fn set(&self, key: &str, value: StoredValue) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<bool>;
    async fn has(&self, key: &str) -> EngineResult<bool>;
    /// Keys matching the glob (`*` any run, `?` one char); all keys when None.
    async fn keys(&self, glob: Option<&str>) -> EngineResult<Vec<String>>;
    async fn clear(&self) -> EngineResult<()>;

    // Tabular surface.
    async fn create_table(&self, def: &TableDefinition) -> EngineResult<()>;
    async fn insert(&self, table: &str, row: Row) -> EngineResult<()>;
    async fn update(&self, table: &str, filter: &Row, patch: &Row) -> EngineResult<u64>;
    async fn delete_rows(&self, table: &str, filter: &Row) -> EngineResult<u64>;
    async fn query(&self, table: &str, opts: &QueryOptions) -> EngineResult<Vec<Row>>;
}

// ── Shared helpers ─────────────────────────────────────────────────────────

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `[A-Za-z_][A-Za-z0-9_]*` — everything else is rejected before it can be
/// spliced into backend SQL.
pub fn validate_ident(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let head_ok = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(EngineError::normalization(format!("invalid identifier '{name}'")))
    }
}

/// Glob match with `*` (any run, including empty) and `?` (exactly one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // Iterative matcher with star backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Parse an `order_by` clause (`"name"` / `"name DESC"`) into column and
/// descending flag, validating the column name.
pub fn parse_order_by(order_by: &str) -> EngineResult<(String, bool)> {
    let mut parts = order_by.split_whitespace();
    let col = parts.next().unwrap_or_default().to_string();
    validate_ident(&col)?;
    let desc = match parts.next() {
        None => false,
        Some(d) if d.eq_ignore_ascii_case("desc") => true,
        Some(d) if d.eq_ignore_ascii_case("asc") => false,
        Some(other) => {
            return Err(EngineError::normalization(format!("bad order direction '{other}'")));
        }
    };
    Ok((col, desc))
}


// ── Contract suite (shared by every backend's tests) ───────────────────────

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use serde_json::json;

    fn people_table() -> TableDefinition {
        TableDefinition {
            name: "people".into(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    column_type: ColumnType::String,
                    primary: true,
                    unique: false,
                    index: false,
                },
                ColumnDef {
                    name: "handle".into(),
                    column_type: ColumnType::String,
                    primary: false,
                    unique: true,
                    index: false,
                },
                ColumnDef {
                    name: "score".into(),
                    column_type: ColumnType::Number,
                    primary: false,
                    unique: false,
                    index: true,
                },
                ColumnDef {
                    name: "meta".into(),
                    column_type: ColumnType::Json,
                    primary: false,
                    unique: false,
                    index: false,
                },
                ColumnDef {
                    name: "joined_at".into(),
                    column_type: ColumnType::Timestamp,
                    primary: false,
                    unique: false,
                    index: false,
                },
            ],
            indexes: vec![vec!["handle".into(), "score".into()]],
        }
    }

    fn row(id: &str, handle: &str, score: i64, meta: Value) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), json!(id));
        r.insert("handle".into(), json!(handle));
        r.insert("score".into(), json!(score));
        r.insert("meta".into(), meta);
        r.insert("joined_at".into(), json!(1_700_000_000_000_i64));
        r
    }

    /// The full adapter contract. Every backend runs this verbatim.
    pub(crate) async fn run(adapter: &dyn StorageAdapter) {
        // ── KV round-trip ───────────────────────────────────────────
        adapter.set("greeting", StoredValue::new(json!("hello"))).await.unwrap();
        let got = adapter.get("greeting").await.unwrap().unwrap();
        assert_eq!(got.value, json!("hello"));
        assert_eq!(got.value_type, StoredType::String);
        assert!(adapter.has("greeting").await.unwrap());

        // Structured values survive structurally.
        let deep = json!({"a": [1, 2, {"b": null}], "unicode": "héllo ✓", "empty": {}});
        adapter.set("deep", StoredValue::new(deep.clone())).await.unwrap();
        assert_eq!(adapter.get("deep").await.unwrap().unwrap().value, deep);

        // ── TTL: expired entries are absent everywhere ──────────────
        let mut doomed = StoredValue::new(json!(42));
        doomed.expires_at = Some(now_ms() - 10);
        adapter.set("doomed", doomed).await.unwrap();
        assert!(adapter.get("doomed").await.unwrap().is_none());
        assert!(!adapter.has("doomed").await.unwrap());
        assert!(!adapter.keys(Some("*")).await.unwrap().contains(&"doomed".to_string()));

        // ── Globs ───────────────────────────────────────────────────
        adapter.set("guild:1:warns", StoredValue::new(json!(3))).await.unwrap();
        adapter.set("guild:2:warns", StoredValue::new(json!(0))).await.unwrap();
        let mut keys = adapter.keys(Some("guild:*:warns")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["guild:1:warns".to_string(), "guild:2:warns".to_string()]);

        // ── Delete ──────────────────────────────────────────────────
        assert!(adapter.delete("greeting").await.unwrap());
        assert!(!adapter.delete("greeting").await.unwrap());
        assert!(adapter.get("greeting").await.unwrap().is_none());

        // ── Tables: create is idempotent ────────────────────────────
        let def = people_table();
        adapter.create_table(&def).await.unwrap();
        adapter.create_table(&def).await.unwrap();

        adapter.insert("people", row("1", "ada", 10, json!({"tags": ["x"]}))).await.unwrap();
        adapter.insert("people", row("2", "grace", 20, json!(null))).await.unwrap();
        adapter.insert("people", row("3", "alan", 15, json!({"tags": []}))).await.unwrap();

        // ── Constraints: primary and unique both reject, count holds ─
        let dup_pk = adapter.insert("people", row("1", "other", 0, json!(null))).await;
        assert!(matches!(dup_pk, Err(EngineError::Constraint(_))), "{dup_pk:?}");
        let dup_unique = adapter.insert("people", row("9", "ada", 0, json!(null))).await;
        assert!(matches!(dup_unique, Err(EngineError::Constraint(_))), "{dup_unique:?}");
        let all = adapter.query("people", &QueryOptions::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        // ── Query: filter, order, limit/offset, projection ──────────
        let mut filter = Row::new();
        filter.insert("handle".into(), json!("grace"));
        let found = adapter
            .query("people", &QueryOptions { filter, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("2"));

        let ordered = adapter
            .query(
                "people",
                &QueryOptions { order_by: Some("score DESC".into()), ..Default::default() },
            )
            .await
            .unwrap();
        let scores: Vec<i64> = ordered.iter().map(|r| r["score"].as_i64().unwrap()).collect();
        assert_eq!(scores, vec![20, 15, 10]);

        let page = adapter
            .query(
                "people",
                &QueryOptions {
                    order_by: Some("score".into()),
                    limit: Some(1),
                    offset: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["score"].as_i64(), Some(15));

        let projected = adapter
            .query(
                "people",
                &QueryOptions {
                    select: Some(vec!["handle".into()]),
                    order_by: Some("handle".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(projected[0].contains_key("handle"));
        assert!(!projected[0].contains_key("score"));

        // JSON columns round-trip structurally.
        let mut filter = Row::new();
        filter.insert("id".into(), json!("1"));
        let one = adapter
            .query("people", &QueryOptions { filter, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(one[0]["meta"], json!({"tags": ["x"]}));

        // ── Update / delete rows ────────────────────────────────────
        let mut filter = Row::new();
        filter.insert("handle".into(), json!("alan"));
        let mut patch = Row::new();
        patch.insert("score".into(), json!(99));
        assert_eq!(adapter.update("people", &filter, &patch).await.unwrap(), 1);
        let mut filter = Row::new();
        filter.insert("score".into(), json!(99));
        assert_eq!(adapter.delete_rows("people", &filter).await.unwrap(), 1);
        assert_eq!(adapter.query("people", &QueryOptions::default()).await.unwrap().len(), 2);

        // ── Injection defense ───────────────────────────────────────
        let bad = TableDefinition {
            name: "x; DROP TABLE people".into(),
            columns: vec![ColumnDef {
                name: "a".into(),
                column_type: ColumnType::String,
                primary: false,
                unique: false,
                index: false,
            }],
            indexes: vec![],
        };
        assert!(adapter.create_table(&bad).await.is_err());

        // ── Clear wipes the KV surface ──────────────────────────────
        adapter.clear().await.unwrap();
        assert!(adapter.keys(None).await.unwrap().is_empty());
    }
}
