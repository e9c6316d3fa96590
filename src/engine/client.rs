// Weft Engine — Platform client surface
//
// The engine never talks to the chat platform directly; every messaging,
// moderation, and registration call goes through this trait. The gateway
// module provides the Discord implementation; `NullClient` records calls in
// memory and backs dry-run mode and the test suites.

use crate::atoms::error::EngineResult;
use crate::engine::spec::{IntentsSpec, SpecDocument};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ── Wire types ─────────────────────────────────────────────────────────────

/// A message ready to leave the engine: resolved content, built embeds and
/// component rows, delivery flags.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embeds: Vec<Value>,
    pub components: Vec<Value>,
    pub ephemeral: bool,
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        OutgoingMessage { content: Some(content.into()), ..Default::default() }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: String,
    pub channel_id: String,
}

/// One interaction in flight. The replied/deferred flags are shared with the
/// dispatcher so a handler error reply is only sent when nothing else
/// answered the interaction.
#[derive(Debug, Clone)]
pub struct InteractionHandle {
    pub id: String,
    pub token: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    replied: Arc<AtomicBool>,
    deferred: Arc<AtomicBool>,
}

impl InteractionHandle {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        InteractionHandle {
            id: id.into(),
            token: token.into(),
            channel_id: String::new(),
            guild_id: None,
            replied: Arc::new(AtomicBool::new(false)),
            deferred: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_replied(&self) {
        self.replied.store(true, Ordering::SeqCst);
    }

    pub fn mark_deferred(&self) {
        self.deferred.store(true, Ordering::SeqCst);
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    /// True when nothing has answered this interaction yet.
    pub fn is_unanswered(&self) -> bool {
        !self.is_replied() && !self.is_deferred()
    }
}

// ── The client trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait PlatformClient: Send + Sync {
    // Messaging.
    async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage)
        -> EngineResult<MessageRef>;
    async fn send_dm(&self, user_id: &str, msg: &OutgoingMessage) -> EngineResult<MessageRef>;
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        msg: &OutgoingMessage,
    ) -> EngineResult<()>;
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> EngineResult<()>;
    async fn bulk_delete(&self, channel_id: &str, count: u64) -> EngineResult<u64>;
    async fn create_thread(
        &self,
        channel_id: &str,
        message_id: Option<&str>,
        name: &str,
    ) -> EngineResult<String>;

    // Interactions.
    async fn reply_interaction(
        &self,
        interaction: &InteractionHandle,
        msg: &OutgoingMessage,
    ) -> EngineResult<()>;
    async fn defer_interaction(
        &self,
        interaction: &InteractionHandle,
        ephemeral: bool,
    ) -> EngineResult<()>;

    // Moderation.
    async fn kick(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> EngineResult<()>;
    async fn ban(
        &self,
        guild_id: &str,
        user_id: &str,
        reason: Option<&str>,
        delete_message_days: u32,
    ) -> EngineResult<()>;
    async fn unban(&self, guild_id: &str, user_id: &str) -> EngineResult<()>;
    /// `until_ms` of None clears an active timeout.
    async fn timeout(&self, guild_id: &str, user_id: &str, until_ms: Option<i64>)
        -> EngineResult<()>;
    async fn add_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()>;
    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()>;

    // Registration and presence.
    async fn register_commands(&self, commands: &[Value], guild_id: Option<&str>)
        -> EngineResult<()>;
    async fn set_presence(&self, presence: &Value) -> EngineResult<()>;
}

// ── Intent derivation ──────────────────────────────────────────────────────

// Gateway intent bits (Discord wire values).
pub const INTENT_GUILDS: u64 = 1 << 0;
pub const INTENT_GUILD_MEMBERS: u64 = 1 << 1;
pub const INTENT_GUILD_VOICE_STATES: u64 = 1 << 7;
pub const INTENT_GUILD_PRESENCES: u64 = 1 << 8;
pub const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
pub const INTENT_GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
pub const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

fn intent_bit(name: &str) -> Option<u64> {
    Some(match name {
        "guilds" => INTENT_GUILDS,
        "guild_members" => INTENT_GUILD_MEMBERS,
        "guild_voice_states" => INTENT_GUILD_VOICE_STATES,
        "guild_presences" => INTENT_GUILD_PRESENCES,
        "guild_messages" => INTENT_GUILD_MESSAGES,
        "guild_message_reactions" => INTENT_GUILD_MESSAGE_REACTIONS,
        "message_content" => INTENT_MESSAGE_CONTENT,
        _ => return None,
    })
}

/// Derive the gateway intent bits for a spec: `auto` computes the minimal set
/// from subscribed events plus declared commands/voice; an explicit list maps
/// names to bits.
pub fn derive_intents(doc: &SpecDocument) -> u64 {
    if let IntentsSpec::Explicit(names) = &doc.intents {
        let mut bits = INTENT_GUILDS;
        for name in names {
            match intent_bit(name) {
                Some(bit) => bits |= bit,
                None => log::warn!("[client] Unknown intent '{name}' ignored"),
            }
        }
        return bits;
    }

    let mut bits = INTENT_GUILDS;
    let events: Vec<&str> = doc.events.iter().map(|h| h.event.as_str()).collect();
    let has = |prefix: &str| events.iter().any(|e| e.starts_with(prefix));

    if has("message") || !doc.commands.is_empty() {
        bits |= INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT;
    }
    if has("guild_member") || has("member") {
        bits |= INTENT_GUILD_MEMBERS;
    }
    if has("voice") || doc.voice.is_some() {
        bits |= INTENT_GUILD_VOICE_STATES;
    }
    if has("message_reaction") || has("reaction") {
        bits |= INTENT_GUILD_MESSAGE_REACTIONS;
    }
    if has("presence") {
        bits |= INTENT_GUILD_PRESENCES;
    }
    bits
}

// ── Recording client ───────────────────────────────────────────────────────

/// One recorded outbound call: the method name plus a JSON snapshot of its
/// arguments.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub args: Value,
}

/// A client that performs no I/O and records everything. Backs `--dry-run`
/// and the test suites.
#[derive(Default)]
pub struct NullClient {
    calls: Mutex<Vec<RecordedCall>>,
    counter: AtomicU64,
}

impl NullClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Recorded calls for one method, in order.
    pub fn calls_named(&self, method: &str) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    fn record(&self, method: &str, args: Value) {
        self.calls.lock().push(RecordedCall { method: method.to_string(), args });
    }

    fn next_id(&self) -> String {
        format!("null-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn msg_json(msg: &OutgoingMessage) -> Value {
    serde_json::json!({
        "content": msg.content,
        "embeds": msg.embeds,
        "components": msg.components,
        "ephemeral": msg.ephemeral,
        "reply_to": msg.reply_to,
    })
}

#[async_trait]
impl PlatformClient for NullClient {
    async fn send_message(
        &self,
        channel_id: &str,
        msg: &OutgoingMessage,
    ) -> EngineResult<MessageRef> {
        self.record("send_message", serde_json::json!({"channel_id": channel_id, "msg": msg_json(msg)}));
        Ok(MessageRef { id: self.next_id(), channel_id: channel_id.to_string() })
    }

    async fn send_dm(&self, user_id: &str, msg: &OutgoingMessage) -> EngineResult<MessageRef> {
        self.record("send_dm", serde_json::json!({"user_id": user_id, "msg": msg_json(msg)}));
        Ok(MessageRef { id: self.next_id(), channel_id: format!("dm-{user_id}") })
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        msg: &OutgoingMessage,
    ) -> EngineResult<()> {
        self.record(
            "edit_message",
            serde_json::json!({"channel_id": channel_id, "message_id": message_id, "msg": msg_json(msg)}),
        );
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> EngineResult<()> {
        self.record(
            "delete_message",
            serde_json::json!({"channel_id": channel_id, "message_id": message_id}),
        );
        Ok(())
    }

    async fn bulk_delete(&self, channel_id: &str, count: u64) -> EngineResult<u64> {
        self.record("bulk_delete", serde_json::json!({"channel_id": channel_id, "count": count}));
        Ok(count)
    }

    async fn create_thread(
        &self,
        channel_id: &str,
        message_id: Option<&str>,
        name: &str,
    ) -> EngineResult<String> {
        self.record(
            "create_thread",
            serde_json::json!({"channel_id": channel_id, "message_id": message_id, "name": name}),
        );
        Ok(self.next_id())
    }

    async fn reply_interaction(
        &self,
        interaction: &InteractionHandle,
        msg: &OutgoingMessage,
    ) -> EngineResult<()> {
        self.record(
            "reply_interaction",
            serde_json::json!({"interaction_id": interaction.id, "msg": msg_json(msg)}),
        );
        interaction.mark_replied();
        Ok(())
    }

    async fn defer_interaction(
        &self,
        interaction: &InteractionHandle,
        ephemeral: bool,
    ) -> EngineResult<()> {
        self.record(
            "defer_interaction",
            serde_json::json!({"interaction_id": interaction.id, "ephemeral": ephemeral}),
        );
        interaction.mark_deferred();
        Ok(())
    }

    async fn kick(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> EngineResult<()> {
        self.record(
            "kick",
            serde_json::json!({"guild_id": guild_id, "user_id": user_id, "reason": reason}),
        );
        Ok(())
    }

    async fn ban(
        &self,
        guild_id: &str,
        user_id: &str,
        reason: Option<&str>,
        delete_message_days: u32,
    ) -> EngineResult<()> {
        self.record(
            "ban",
            serde_json::json!({
                "guild_id": guild_id, "user_id": user_id,
                "reason": reason, "delete_message_days": delete_message_days,
            }),
        );
        Ok(())
    }

    async fn unban(&self, guild_id: &str, user_id: &str) -> EngineResult<()> {
        self.record("unban", serde_json::json!({"guild_id": guild_id, "user_id": user_id}));
        Ok(())
    }

    async fn timeout(
        &self,
        guild_id: &str,
        user_id: &str,
        until_ms: Option<i64>,
    ) -> EngineResult<()> {
        self.record(
            "timeout",
            serde_json::json!({"guild_id": guild_id, "user_id": user_id, "until_ms": until_ms}),
        );
        Ok(())
    }

    async fn add_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()> {
        self.record(
            "add_role",
            serde_json::json!({"guild_id": guild_id, "user_id": user_id, "role_id": role_id}),
        );
        Ok(())
    }

    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()> {
        self.record(
            "remove_role",
            serde_json::json!({"guild_id": guild_id, "user_id": user_id, "role_id": role_id}),
        );
        Ok(())
    }

    async fn register_commands(
        &self,
        commands: &[Value],
        guild_id: Option<&str>,
    ) -> EngineResult<()> {
        self.record(
            "register_commands",
            serde_json::json!({"commands": commands, "guild_id": guild_id}),
        );
        Ok(())
    }

    async fn set_presence(&self, presence: &Value) -> EngineResult<()> {
        self.record("set_presence", presence.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec::parse_spec;

    #[test]
    fn auto_intents_from_events() {
        let doc = parse_spec(
            r#"
events:
  message_create: [{log: {message: m}}]
  member_join: [{log: {message: j}}]
  message_reaction_add: [{log: {message: r}}]
"#,
        )
        .unwrap();
        let bits = derive_intents(&doc);
        assert!(bits & INTENT_GUILDS != 0);
        assert!(bits & INTENT_GUILD_MESSAGES != 0);
        assert!(bits & INTENT_MESSAGE_CONTENT != 0);
        assert!(bits & INTENT_GUILD_MEMBERS != 0);
        assert!(bits & INTENT_GUILD_MESSAGE_REACTIONS != 0);
        assert!(bits & INTENT_GUILD_VOICE_STATES == 0);
        assert!(bits & INTENT_GUILD_PRESENCES == 0);
    }

    #[test]
    fn commands_imply_message_intents() {
        let doc = parse_spec("commands:\n  - {name: ping, actions: []}\n").unwrap();
        let bits = derive_intents(&doc);
        assert!(bits & (INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT) != 0);
    }

    #[test]
    fn voice_config_implies_voice_states() {
        let doc = parse_spec("voice:\n  max_queue_size: 10\n").unwrap();
        assert!(derive_intents(&doc) & INTENT_GUILD_VOICE_STATES != 0);
    }

    #[test]
    fn explicit_intents_map_names() {
        let doc = parse_spec("intents: [guild_members, message_content]\n").unwrap();
        let bits = derive_intents(&doc);
        assert_eq!(bits, INTENT_GUILDS | INTENT_GUILD_MEMBERS | INTENT_MESSAGE_CONTENT);
    }

    #[test]
    fn interaction_dedupe_flags() {
        let h = InteractionHandle::new("1", "t");
        assert!(h.is_unanswered());
        h.mark_deferred();
        assert!(!h.is_unanswered());
        assert!(h.is_deferred());
        assert!(!h.is_replied());
    }
}
