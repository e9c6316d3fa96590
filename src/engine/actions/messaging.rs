// Messaging actions: reply, send_message, send_dm, edit_message,
// delete_message, bulk_delete, defer, create_thread.

use super::{id_or_ctx, p_bool, p_str, p_str_any, p_u64, req_str};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::builders;
use crate::engine::context::ActionContext;
use crate::engine::executor::Executor;
use serde_json::{json, Map, Value};

/// Assemble an `OutgoingMessage` from a parameter bag: content, embeds,
/// buttons/selects (each built through the template registry), flags.
fn build_outgoing(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &ActionContext,
) -> EngineResult<crate::engine::client::OutgoingMessage> {
    let mut msg = crate::engine::client::OutgoingMessage {
        content: p_str(params, "content"),
        ephemeral: p_bool(params, "ephemeral"),
        reply_to: p_str_any(params, &["reply_to", "reference"]),
        ..Default::default()
    };

    if let Some(embed) = params.get("embed") {
        msg.embeds.push(builders::build_embed(&exec.templates, embed, &ctx.values)?);
    }
    for embed in params.get("embeds").and_then(Value::as_array).into_iter().flatten() {
        msg.embeds.push(builders::build_embed(&exec.templates, embed, &ctx.values)?);
    }

    if let Some(buttons) = params.get("buttons").and_then(Value::as_array) {
        let row: Vec<Value> = buttons
            .iter()
            .map(|b| builders::build_button(&exec.templates, b, &ctx.values))
            .collect::<EngineResult<_>>()?;
        if !row.is_empty() {
            msg.components.push(builders::action_row(row));
        }
    }
    if let Some(select) = params.get("select") {
        let built = builders::build_select(&exec.templates, select, &ctx.values)?;
        msg.components.push(builders::action_row(vec![built]));
    }

    if msg.content.is_none() && msg.embeds.is_empty() {
        return Err(EngineError::parameter("message needs content or an embed"));
    }
    Ok(msg)
}

/// Reply to the triggering interaction, or fall back to the context channel.
pub async fn reply(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let msg = build_outgoing(exec, params, ctx)?;
    if let Some(interaction) = &ctx.interaction {
        if interaction.is_unanswered() || interaction.is_deferred() {
            exec.client.reply_interaction(interaction, &msg).await?;
            interaction.mark_replied();
            return Ok(json!({"replied": true}));
        }
    }
    let channel = id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "reply")?;
    let sent = exec.client.send_message(&channel, &msg).await?;
    Ok(json!({"id": sent.id, "channel_id": sent.channel_id}))
}

pub async fn send_message(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let channel = id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "send_message")?;
    let msg = build_outgoing(exec, params, ctx)?;
    let sent = exec.client.send_message(&channel, &msg).await?;
    Ok(json!({"id": sent.id, "channel_id": sent.channel_id}))
}

pub async fn send_dm(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let user = id_or_ctx(params, &["user", "user_id"], ctx, "user.id", "send_dm")?;
    let msg = build_outgoing(exec, params, ctx)?;
    let sent = exec.client.send_dm(&user, &msg).await?;
    Ok(json!({"id": sent.id, "channel_id": sent.channel_id}))
}

pub async fn edit_message(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let channel = id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "edit_message")?;
    let message =
        id_or_ctx(params, &["message", "message_id"], ctx, "message.id", "edit_message")?;
    let msg = build_outgoing(exec, params, ctx)?;
    exec.client.edit_message(&channel, &message, &msg).await?;
    Ok(json!({"edited": true}))
}

pub async fn delete_message(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let channel =
        id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "delete_message")?;
    let message =
        id_or_ctx(params, &["message", "message_id"], ctx, "message.id", "delete_message")?;
    exec.client.delete_message(&channel, &message).await?;
    Ok(json!({"deleted": true}))
}

pub async fn bulk_delete(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let channel = id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "bulk_delete")?;
    let count = p_u64(params, "count").unwrap_or(10).clamp(1, 100);
    let deleted = exec.client.bulk_delete(&channel, count).await?;
    Ok(json!({"deleted": deleted}))
}

/// Acknowledge the interaction so the platform stops the response clock.
pub async fn defer(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let Some(interaction) = &ctx.interaction else {
        return Ok(json!({"deferred": false}));
    };
    if interaction.is_unanswered() {
        exec.client.defer_interaction(interaction, p_bool(params, "ephemeral")).await?;
        interaction.mark_deferred();
    }
    Ok(json!({"deferred": true}))
}

pub async fn create_thread(
    exec: &Executor,
    params: &Map<String, Value>,
    ctx: &mut ActionContext,
) -> EngineResult<Value> {
    let channel =
        id_or_ctx(params, &["channel", "channel_id"], ctx, "channel.id", "create_thread")?;
    let name = req_str(params, "name", "create_thread")?;
    let message = p_str_any(params, &["message", "message_id"]);
    let thread_id = exec.client.create_thread(&channel, message.as_deref(), &name).await?;
    Ok(json!({"thread_id": thread_id}))
}
