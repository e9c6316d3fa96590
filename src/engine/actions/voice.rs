// Voice actions. Guild comes from the context unless overridden; playback
// state itself lives in the voice manager.

use super::{id_or_ctx, p_bool, p_str, p_str_any, p_u64, req_str};
use crate::atoms::error::EngineResult;
use crate::engine::context::ActionContext;
use crate::engine::executor::Executor;
use crate::engine::voice::{LoopMode, QueueItem, QueuePosition};
use serde_json::{json, Map, Value};

fn guild_of(
    params: &Map<String, Value>,
    ctx: &ActionContext,
    verb: &str,
) -> EngineResult<String> {
    id_or_ctx(params, &["guild", "guild_id"], ctx, "guild.id", verb)
}

/// Resolve a `source` parameter into a queue item: URLs pass through,
/// anything else goes through backend search.
async fn resolve_source(
    exec: &Executor,
    source: &str,
    requester: Option<String>,
) -> EngineResult<QueueItem> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(QueueItem {
            url: source.to_string(),
            title: source.to_string(),
            duration_ms: None,
            thumbnail: None,
            requester_id: requester,
        });
    }
    let mut results = exec.voice.search(source).await?;
    let mut item = results
        .drain(..)
        .next()
        .ok_or_else(|| crate::atoms::error::EngineError::backend(format!("no results for '{source}'")))?;
    item.requester_id = requester;
    Ok(item)
}

pub async fn join(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_join")?;
    let channel = id_or_ctx(params, &["channel", "channel_id"], ctx, "voice_channel.id", "voice_join")?;
    exec.voice
        .join(&guild, &channel, p_bool(params, "self_deaf"), p_bool(params, "self_mute"))
        .await?;
    Ok(json!({"joined": channel}))
}

pub async fn leave(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_leave")?;
    exec.voice.leave(&guild).await?;
    Ok(json!({"left": guild}))
}

/// Play a source now, or enqueue it when something is already playing.
pub async fn play(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_play")?;
    let source = p_str_any(params, &["source", "url", "query"])
        .ok_or_else(|| crate::atoms::error::EngineError::parameter("'voice_play' requires 'source'"))?;
    let requester = p_str(params, "requester")
        .or_else(|| Some(crate::engine::expr::value::to_display_string(&ctx.get_path("user.id"))))
        .filter(|s| !s.is_empty());
    let item = resolve_source(exec, &source, requester).await?;

    let playing_now = exec.voice.status(&guild).map(|s| s.playing).unwrap_or(false);
    if playing_now {
        let len = exec.voice.add_to_queue(&guild, item.clone(), QueuePosition::Last)?;
        return Ok(json!({"queued": true, "position": len, "title": item.title}));
    }
    let volume = p_u64(params, "volume").map(|v| v as u32);
    let seek = p_u64(params, "seek").unwrap_or(0);
    exec.voice.play(&guild, item.clone(), volume, seek).await?;
    Ok(json!({"playing": item.title}))
}

pub async fn search(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let query = req_str(params, "query", "voice_search")?;
    let results = exec.voice.search(&query).await?;
    let out = serde_json::to_value(&results)?;
    let bind = p_str(params, "as").unwrap_or_else(|| "tracks".to_string());
    ctx.set(&bind, out.clone());
    Ok(out)
}

pub async fn pause(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_pause")?;
    exec.voice.pause(&guild).await?;
    Ok(json!({"paused": true}))
}

pub async fn resume(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_resume")?;
    exec.voice.resume(&guild).await?;
    Ok(json!({"resumed": true}))
}

pub async fn skip(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_skip")?;
    let next = exec.voice.skip(&guild).await?;
    Ok(json!({"skipped": true, "now_playing": next.map(|t| t.title)}))
}

pub async fn stop(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_stop")?;
    exec.voice.stop(&guild).await?;
    Ok(json!({"stopped": true}))
}

pub async fn seek(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_seek")?;
    let position = params
        .get("position")
        .and_then(super::parse_duration_ms)
        .ok_or_else(|| crate::atoms::error::EngineError::parameter("'voice_seek' requires 'position'"))?;
    exec.voice.seek(&guild, position).await?;
    Ok(json!({"position_ms": position}))
}

/// Replace the active filter set; `filters: []` clears it.
pub async fn filter(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_filter")?;
    let filters: Vec<String> = match params.get("filters") {
        Some(Value::Array(items)) => {
            items.iter().map(crate::engine::expr::value::to_display_string).collect()
        }
        _ => p_str(params, "filter").into_iter().collect(),
    };
    exec.voice.set_filters(&guild, filters.clone()).await?;
    Ok(json!({"filters": filters}))
}

pub async fn volume(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_volume")?;
    let wanted = p_u64(params, "volume").or_else(|| p_u64(params, "level")).unwrap_or(100) as u32;
    let applied = exec.voice.set_volume(&guild, wanted).await?;
    Ok(json!({"volume": applied}))
}

pub async fn set_loop(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "voice_loop")?;
    let mode = LoopMode::parse(&p_str(params, "mode").unwrap_or_default());
    exec.voice.set_loop(&guild, mode)?;
    Ok(json!({"loop": format!("{mode:?}").to_lowercase()}))
}

pub async fn queue_add(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "queue_add")?;
    let source = p_str_any(params, &["source", "url", "query"])
        .ok_or_else(|| crate::atoms::error::EngineError::parameter("'queue_add' requires 'source'"))?;
    let requester = p_str(params, "requester");
    let item = resolve_source(exec, &source, requester).await?;
    let position = params.get("position").map(QueuePosition::parse).unwrap_or(QueuePosition::Last);
    let len = exec.voice.add_to_queue(&guild, item.clone(), position)?;
    Ok(json!({"queued": item.title, "queue_length": len}))
}

pub async fn queue_clear(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "queue_clear")?;
    let removed = exec.voice.clear_queue(&guild)?;
    Ok(json!({"removed": removed}))
}

pub async fn queue_shuffle(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = guild_of(params, ctx, "queue_shuffle")?;
    exec.voice.shuffle_queue(&guild)?;
    Ok(json!({"shuffled": true}))
}
