// Moderation actions: kick, ban, unban, timeout, add_role, remove_role.
// Guild and user default to the triggering context when not given.

use super::{id_or_ctx, p_str, p_u64, parse_duration_ms, req_str};
use crate::atoms::error::EngineResult;
use crate::engine::context::ActionContext;
use crate::engine::executor::Executor;
use serde_json::{json, Map, Value};

fn guild_and_user(
    params: &Map<String, Value>,
    ctx: &ActionContext,
    verb: &str,
) -> EngineResult<(String, String)> {
    let guild = id_or_ctx(params, &["guild", "guild_id"], ctx, "guild.id", verb)?;
    let user = id_or_ctx(params, &["user", "user_id"], ctx, "user.id", verb)?;
    Ok((guild, user))
}

pub async fn kick(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let (guild, user) = guild_and_user(params, ctx, "kick")?;
    let reason = p_str(params, "reason");
    exec.client.kick(&guild, &user, reason.as_deref()).await?;
    log::info!("[moderation] Kicked {user} from {guild}");
    Ok(json!({"kicked": user}))
}

pub async fn ban(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let (guild, user) = guild_and_user(params, ctx, "ban")?;
    let reason = p_str(params, "reason");
    let delete_days = p_u64(params, "delete_message_days").unwrap_or(0).min(7) as u32;
    exec.client.ban(&guild, &user, reason.as_deref(), delete_days).await?;
    log::info!("[moderation] Banned {user} from {guild}");
    Ok(json!({"banned": user}))
}

pub async fn unban(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let guild = id_or_ctx(params, &["guild", "guild_id"], ctx, "guild.id", "unban")?;
    let user = req_str(params, "user", "unban")
        .or_else(|_| req_str(params, "user_id", "unban"))?;
    exec.client.unban(&guild, &user).await?;
    Ok(json!({"unbanned": user}))
}

/// Timeout with a `duration`; omit the duration to clear an active timeout.
pub async fn timeout(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let (guild, user) = guild_and_user(params, ctx, "timeout")?;
    let until_ms = params
        .get("duration")
        .and_then(parse_duration_ms)
        .map(|d| crate::engine::storage::now_ms() + d as i64);
    exec.client.timeout(&guild, &user, until_ms).await?;
    Ok(json!({"user": user, "until": until_ms}))
}

pub async fn add_role(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let (guild, user) = guild_and_user(params, ctx, "add_role")?;
    let role = req_str(params, "role", "add_role")?;
    exec.client.add_role(&guild, &user, &role).await?;
    Ok(json!({"user": user, "role": role}))
}

pub async fn remove_role(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let (guild, user) = guild_and_user(params, ctx, "remove_role")?;
    let role = req_str(params, "role", "remove_role")?;
    exec.client.remove_role(&guild, &user, &role).await?;
    Ok(json!({"user": user, "role": role}))
}
