// Control-feedback actions: log, emit, timer_create, timer_cancel.

use super::{p_str, parse_duration_ms, req_str};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::context::{ActionContext, SyntheticEvent};
use crate::engine::executor::Executor;
use serde_json::{json, Map, Value};

pub async fn log_action(
    _exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let message = p_str(params, "message").unwrap_or_default();
    match p_str(params, "level").as_deref() {
        Some("error") => log::error!("[spec] {message}"),
        Some("warn") => log::warn!("[spec] {message}"),
        Some("debug") => log::debug!("[spec] {message}"),
        _ => log::info!("[spec] {message}"),
    }
    Ok(json!({"logged": true}))
}

/// Push a synthetic event back through the router.
pub async fn emit(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let event = req_str(params, "event", "emit")?;
    let data = params.get("data").cloned().unwrap_or(Value::Null);
    exec.events_tx
        .send(SyntheticEvent { name: event.clone(), data })
        .map_err(|_| EngineError::backend("event channel closed"))?;
    Ok(json!({"emitted": event}))
}

pub async fn timer_create(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let event = req_str(params, "event", "timer_create")?;
    let duration = params
        .get("duration")
        .and_then(parse_duration_ms)
        .ok_or_else(|| EngineError::parameter("'timer_create' requires 'duration'"))?;
    let id = exec.timers.create(
        p_str(params, "id"),
        event,
        params.get("data").cloned().unwrap_or(Value::Null),
        duration,
    );
    Ok(json!({"id": id}))
}

pub async fn timer_cancel(
    exec: &Executor,
    params: &Map<String, Value>,
    _ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let id = req_str(params, "id", "timer_cancel")?;
    Ok(json!({"cancelled": exec.timers.cancel(&id)}))
}
