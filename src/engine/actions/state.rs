// State actions: set, set_variable, increment, db_insert, db_query,
// db_update, db_delete. Query results land in the context under `as`.

use super::{p_str, p_u64, parse_duration_ms, req_str};
use crate::atoms::error::EngineResult;
use crate::engine::context::ActionContext;
use crate::engine::executor::Executor;
use crate::engine::storage::{QueryOptions, Row, StoredValue};
use serde_json::{json, Map, Value};

/// Raw key/value write, with optional TTL.
pub async fn set(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let key = req_str(params, "key", "set")?;
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    let stored = match params.get("ttl").and_then(parse_duration_ms) {
        Some(ttl) => StoredValue::with_ttl(value, ttl as i64),
        None => StoredValue::new(value),
    };
    exec.storage.set(&key, stored).await?;
    Ok(json!({"key": key}))
}

/// Declared-variable write through the scope-aware state manager.
pub async fn set_variable(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let name = req_str(params, "name", "set_variable")?;
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    exec.state.set(&name, ctx, value.clone()).await?;
    // The rest of this flow sees the new value without a re-read.
    ctx.set(&name, value);
    Ok(json!({"name": name}))
}

pub async fn increment(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let name = req_str(params, "name", "increment")?;
    let by = params.get("by").and_then(crate::engine::expr::value::as_number).unwrap_or(1.0);
    let next = exec.state.increment(&name, ctx, by).await?;
    ctx.set(&name, next.clone());
    Ok(next)
}

fn row_param(params: &Map<String, Value>, keys: &[&str]) -> Row {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default()
}

pub async fn db_insert(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let table = req_str(params, "table", "db_insert")?;
    let row = row_param(params, &["row", "data", "values"]);
    exec.storage.insert(&table, row).await?;
    Ok(json!({"inserted": 1}))
}

pub async fn db_query(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let table = req_str(params, "table", "db_query")?;
    let opts = QueryOptions {
        select: params
            .get("select")
            .and_then(Value::as_array)
            .map(|cols| cols.iter().map(crate::engine::expr::value::to_display_string).collect()),
        filter: row_param(params, &["where", "filter"]),
        order_by: p_str(params, "order_by"),
        limit: p_u64(params, "limit"),
        offset: p_u64(params, "offset"),
    };
    let rows = exec.storage.query(&table, &opts).await?;
    let out = Value::Array(rows.into_iter().map(Value::Object).collect());
    let bind = p_str(params, "as").unwrap_or_else(|| "results".to_string());
    ctx.set(&bind, out.clone());
    Ok(out)
}

pub async fn db_update(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let table = req_str(params, "table", "db_update")?;
    let filter = row_param(params, &["where", "filter"]);
    let patch = row_param(params, &["set", "patch", "values"]);
    let count = exec.storage.update(&table, &filter, &patch).await?;
    Ok(json!({"updated": count}))
}

pub async fn db_delete(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let table = req_str(params, "table", "db_delete")?;
    let filter = row_param(params, &["where", "filter"]);
    let count = exec.storage.delete_rows(&table, &filter).await?;
    Ok(json!({"deleted": count}))
}
