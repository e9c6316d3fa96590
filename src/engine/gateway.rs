// Weft Engine — Discord reference client
//
// Implements the platform client surface over Discord's REST v10 and feeds
// gateway v10 events into the engine. The bot opens a persistent WebSocket
// to the gateway, identifies with the intent bits derived from the spec,
// heartbeats on the interval the Hello frame dictates, and reconnects with
// escalating backoff when the socket drops.
//
// Every REST call goes through `discord_request`, which retries once on 429
// honoring `retry_after` and treats 204 as success.

use crate::atoms::constants::{MESSAGE_SPLIT_LIMIT, READY_TIMEOUT_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::client::{InteractionHandle, MessageRef, OutgoingMessage, PlatformClient};
use crate::engine::interactions::InteractionKind;
use crate::engine::runtime::Engine;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const DISCORD_API: &str = "https://discord.com/api/v10";

const INITIAL_RECONNECT_DELAY_MS: u64 = 1_000;
const MAX_RECONNECT_DELAY_MS: u64 = 300_000;

/// Exponential backoff with ±25% jitter, capped at five minutes.
fn reconnect_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base_ms = INITIAL_RECONNECT_DELAY_MS.saturating_mul(2u64.pow(attempt.min(12)));
    let capped = base_ms.min(MAX_RECONNECT_DELAY_MS);
    let jitter = capped / 4;
    let low = capped.saturating_sub(jitter);
    let high = capped + jitter;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Split a long message on line boundaries so every chunk fits the platform
/// cap; a single oversized line falls back to a hard split.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        let line_len = line.chars().count();
        if current.chars().count() + line_len + 1 > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if line_len > limit {
                let mut rest: Vec<char> = line.chars().collect();
                while rest.len() > limit {
                    chunks.push(rest.drain(..limit).collect());
                }
                current = rest.into_iter().collect();
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ── Gateway payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    d: Option<Value>,
    s: Option<u64>,
    t: Option<String>,
}

// ── REST client ────────────────────────────────────────────────────────────

pub struct DiscordClient {
    token: String,
    http: reqwest::Client,
    application_id: OnceLock<String>,
    bot_user_id: OnceLock<String>,
    /// Writer handle into the live gateway socket (presence updates).
    gateway_tx: Mutex<Option<UnboundedSender<Value>>>,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>) -> Self {
        DiscordClient {
            token: token.into(),
            http: reqwest::Client::new(),
            application_id: OnceLock::new(),
            bot_user_id: OnceLock::new(),
            gateway_tx: Mutex::new(None),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// One REST call with automatic rate-limit retry (once).
    async fn discord_request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> EngineResult<Value> {
        let send = |method: reqwest::Method| {
            let mut req = self
                .http
                .request(method, url)
                .header("Authorization", self.auth())
                .header("Content-Type", "application/json");
            if let Some(b) = body {
                req = req.json(b);
            }
            req.send()
        };

        let resp = send(method.clone()).await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            let retry_after = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["retry_after"].as_f64())
                .unwrap_or(1.0);
            warn!("[gateway] Rate limited, waiting {retry_after:.1}s");
            tokio::time::sleep(Duration::from_secs_f64(retry_after + 0.1)).await;
            let resp = send(method).await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(EngineError::backend(format!(
                    "Discord API {status} (after retry): {}",
                    &text[..text.len().min(300)]
                )));
            }
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }

        if status.as_u16() == 204 {
            return Ok(json!({"ok": true}));
        }
        if !status.is_success() {
            return Err(EngineError::backend(format!(
                "Discord API {status}: {}",
                &text[..text.len().min(300)]
            )));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn message_body(msg: &OutgoingMessage, content: Option<&str>) -> Value {
        let mut body = Map::new();
        if let Some(c) = content {
            body.insert("content".into(), json!(c));
        }
        if !msg.embeds.is_empty() {
            body.insert("embeds".into(), Value::Array(msg.embeds.clone()));
        }
        if !msg.components.is_empty() {
            body.insert("components".into(), Value::Array(msg.components.clone()));
        }
        if let Some(reply_to) = &msg.reply_to {
            body.insert("message_reference".into(), json!({"message_id": reply_to}));
        }
        Value::Object(body)
    }

    async fn post_message(&self, channel_id: &str, msg: &OutgoingMessage) -> EngineResult<MessageRef> {
        let url = format!("{DISCORD_API}/channels/{channel_id}/messages");
        let content = msg.content.as_deref().unwrap_or("");
        let chunks = if content.is_empty() {
            vec![String::new()]
        } else {
            split_message(content, MESSAGE_SPLIT_LIMIT)
        };
        let last_index = chunks.len() - 1;
        let mut last = MessageRef { id: String::new(), channel_id: channel_id.to_string() };
        for (i, chunk) in chunks.into_iter().enumerate() {
            // Embeds and components ride on the final chunk only.
            let body = if i == last_index {
                Self::message_body(msg, (!chunk.is_empty()).then_some(chunk.as_str()))
            } else {
                json!({"content": chunk})
            };
            let sent = self.discord_request(reqwest::Method::POST, &url, Some(&body)).await?;
            last.id = sent["id"].as_str().unwrap_or_default().to_string();
        }
        Ok(last)
    }

    fn application_id(&self) -> EngineResult<&str> {
        self.application_id
            .get()
            .map(String::as_str)
            .ok_or_else(|| EngineError::backend("application id not known before READY"))
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage) -> EngineResult<MessageRef> {
        self.post_message(channel_id, msg).await
    }

    async fn send_dm(&self, user_id: &str, msg: &OutgoingMessage) -> EngineResult<MessageRef> {
        let dm = self
            .discord_request(
                reqwest::Method::POST,
                &format!("{DISCORD_API}/users/@me/channels"),
                Some(&json!({"recipient_id": user_id})),
            )
            .await?;
        let channel_id = dm["id"]
            .as_str()
            .ok_or_else(|| EngineError::backend("DM channel has no id"))?
            .to_string();
        self.post_message(&channel_id, msg).await
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        msg: &OutgoingMessage,
    ) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/channels/{channel_id}/messages/{message_id}");
        let body = Self::message_body(msg, msg.content.as_deref());
        self.discord_request(reqwest::Method::PATCH, &url, Some(&body)).await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/channels/{channel_id}/messages/{message_id}");
        self.discord_request(reqwest::Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn bulk_delete(&self, channel_id: &str, count: u64) -> EngineResult<u64> {
        let count = count.clamp(2, 100);
        let recent = self
            .discord_request(
                reqwest::Method::GET,
                &format!("{DISCORD_API}/channels/{channel_id}/messages?limit={count}"),
                None,
            )
            .await?;
        let ids: Vec<Value> = recent
            .as_array()
            .map(|msgs| msgs.iter().filter_map(|m| m.get("id").cloned()).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = ids.len() as u64;
        self.discord_request(
            reqwest::Method::POST,
            &format!("{DISCORD_API}/channels/{channel_id}/messages/bulk-delete"),
            Some(&json!({"messages": ids})),
        )
        .await?;
        Ok(deleted)
    }

    async fn create_thread(
        &self,
        channel_id: &str,
        message_id: Option<&str>,
        name: &str,
    ) -> EngineResult<String> {
        let url = match message_id {
            Some(mid) => format!("{DISCORD_API}/channels/{channel_id}/messages/{mid}/threads"),
            None => format!("{DISCORD_API}/channels/{channel_id}/threads"),
        };
        let mut body = json!({"name": name});
        if message_id.is_none() {
            body["type"] = json!(11); // public thread
        }
        let thread = self.discord_request(reqwest::Method::POST, &url, Some(&body)).await?;
        Ok(thread["id"].as_str().unwrap_or_default().to_string())
    }

    async fn reply_interaction(
        &self,
        interaction: &InteractionHandle,
        msg: &OutgoingMessage,
    ) -> EngineResult<()> {
        if interaction.is_deferred() || interaction.is_replied() {
            // Follow-up webhook once the original response exists.
            let app_id = self.application_id()?;
            let url = format!("{DISCORD_API}/webhooks/{app_id}/{}", interaction.token);
            let body = Self::message_body(msg, msg.content.as_deref());
            self.discord_request(reqwest::Method::POST, &url, Some(&body)).await?;
            return Ok(());
        }
        let url = format!(
            "{DISCORD_API}/interactions/{}/{}/callback",
            interaction.id, interaction.token
        );
        let mut data = Self::message_body(msg, msg.content.as_deref());
        if msg.ephemeral {
            data["flags"] = json!(64);
        }
        self.discord_request(reqwest::Method::POST, &url, Some(&json!({"type": 4, "data": data})))
            .await?;
        Ok(())
    }

    async fn defer_interaction(
        &self,
        interaction: &InteractionHandle,
        ephemeral: bool,
    ) -> EngineResult<()> {
        let url = format!(
            "{DISCORD_API}/interactions/{}/{}/callback",
            interaction.id, interaction.token
        );
        let data = if ephemeral { json!({"flags": 64}) } else { json!({}) };
        self.discord_request(reqwest::Method::POST, &url, Some(&json!({"type": 5, "data": data})))
            .await?;
        Ok(())
    }

    async fn kick(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/members/{user_id}");
        let mut req = self.http.delete(&url).header("Authorization", self.auth());
        if let Some(reason) = reason {
            req = req.header("X-Audit-Log-Reason", reason);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() && resp.status().as_u16() != 204 {
            return Err(EngineError::backend(format!("kick failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn ban(
        &self,
        guild_id: &str,
        user_id: &str,
        reason: Option<&str>,
        delete_message_days: u32,
    ) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/bans/{user_id}");
        let body = json!({"delete_message_seconds": delete_message_days as u64 * 86_400});
        let mut req = self
            .http
            .put(&url)
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(reason) = reason {
            req = req.header("X-Audit-Log-Reason", reason);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() && resp.status().as_u16() != 204 {
            return Err(EngineError::backend(format!("ban failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn unban(&self, guild_id: &str, user_id: &str) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/bans/{user_id}");
        self.discord_request(reqwest::Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn timeout(
        &self,
        guild_id: &str,
        user_id: &str,
        until_ms: Option<i64>,
    ) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/members/{user_id}");
        let until = until_ms.and_then(|ms| {
            chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
        });
        self.discord_request(
            reqwest::Method::PATCH,
            &url,
            Some(&json!({"communication_disabled_until": until})),
        )
        .await?;
        Ok(())
    }

    async fn add_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/members/{user_id}/roles/{role_id}");
        self.discord_request(reqwest::Method::PUT, &url, None).await?;
        Ok(())
    }

    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> EngineResult<()> {
        let url = format!("{DISCORD_API}/guilds/{guild_id}/members/{user_id}/roles/{role_id}");
        self.discord_request(reqwest::Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn register_commands(
        &self,
        commands: &[Value],
        guild_id: Option<&str>,
    ) -> EngineResult<()> {
        let app_id = self.application_id()?;
        let url = match guild_id {
            Some(gid) => format!("{DISCORD_API}/applications/{app_id}/guilds/{gid}/commands"),
            None => format!("{DISCORD_API}/applications/{app_id}/commands"),
        };
        self.discord_request(reqwest::Method::PUT, &url, Some(&Value::Array(commands.to_vec())))
            .await?;
        Ok(())
    }

    async fn set_presence(&self, presence: &Value) -> EngineResult<()> {
        let tx = self.gateway_tx.lock().clone();
        match tx {
            Some(tx) => {
                tx.send(json!({"op": 3, "d": presence}))
                    .map_err(|_| EngineError::backend("gateway writer closed"))?;
                Ok(())
            }
            None => Err(EngineError::backend("gateway not connected")),
        }
    }
}

// ── Gateway bridge ─────────────────────────────────────────────────────────

pub struct GatewayBridge {
    client: Arc<DiscordClient>,
    engine: Arc<Engine>,
    intents: u64,
    stop: Arc<AtomicBool>,
}

impl GatewayBridge {
    pub fn new(client: Arc<DiscordClient>, engine: Arc<Engine>, intents: u64) -> Self {
        GatewayBridge { client, engine, intents, stop: Arc::new(AtomicBool::new(false)) }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Run the gateway until stopped, reconnecting with backoff on errors.
    /// The first READY must arrive within the engine's ready timeout.
    pub async fn run(&self) -> EngineResult<()> {
        let mut attempt: u32 = 0;
        let mut ever_ready = false;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let was_ready = ever_ready;
            let session = self.run_session(&mut ever_ready);
            let outcome = if was_ready {
                session.await
            } else {
                match tokio::time::timeout(Duration::from_secs(READY_TIMEOUT_SECS), session).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return Err(EngineError::ReadyTimeout(
                            "gateway READY did not arrive in time".into(),
                        ));
                    }
                }
            };
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let delay = reconnect_delay(attempt);
                    warn!(
                        "[gateway] Session error: {e} — reconnecting in {}ms (attempt {})",
                        delay.as_millis(),
                        attempt + 1
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        info!("[gateway] Stopped");
        Ok(())
    }

    async fn run_session(&self, ever_ready: &mut bool) -> EngineResult<()> {
        let (ws_stream, _) = connect_async(DISCORD_GATEWAY_URL)
            .await
            .map_err(|e| EngineError::backend(format!("gateway connect: {e}")))?;
        let (write, mut read) = ws_stream.split();

        // Hello (op 10) carries the heartbeat interval.
        let hello = read
            .next()
            .await
            .ok_or_else(|| EngineError::backend("gateway closed before Hello"))?
            .map_err(|e| EngineError::backend(e.to_string()))?;
        let hello: GatewayPayload = serde_json::from_str(
            hello.to_text().map_err(|e| EngineError::backend(e.to_string()))?,
        )?;
        if hello.op != 10 {
            return Err(EngineError::backend(format!("expected Hello, got op {}", hello.op)));
        }
        let heartbeat_interval = hello
            .d
            .as_ref()
            .and_then(|d| d["heartbeat_interval"].as_u64())
            .unwrap_or(41_250);
        info!("[gateway] Connected, heartbeat_interval={heartbeat_interval}ms");

        // All writes (identify, heartbeats, presence) go through one queue.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        *self.client.gateway_tx.lock() = Some(tx.clone());
        let writer = tokio::spawn(async move {
            let mut write = write;
            while let Some(payload) = rx.recv().await {
                if write.send(WsMessage::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
        });

        tx.send(json!({
            "op": 2,
            "d": {
                "token": self.client.token,
                "intents": self.intents,
                "properties": {"os": std::env::consts::OS, "browser": "weft", "device": "weft"},
            }
        }))
        .ok();

        // Heartbeat task fed the latest sequence number.
        let (seq_tx, mut seq_rx) = tokio::sync::mpsc::channel::<Option<u64>>(16);
        let hb_tx = tx.clone();
        let hb_stop = self.stop.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(heartbeat_interval)).await;
                if hb_stop.load(Ordering::Relaxed) {
                    break;
                }
                let seq = seq_rx.try_recv().ok().flatten();
                if hb_tx.send(json!({"op": 1, "d": seq})).is_err() {
                    break;
                }
            }
        });

        let outcome = self.read_loop(&mut read, &seq_tx, ever_ready).await;

        heartbeat.abort();
        writer.abort();
        *self.client.gateway_tx.lock() = None;
        outcome
    }

    async fn read_loop(
        &self,
        read: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        seq_tx: &tokio::sync::mpsc::Sender<Option<u64>>,
        ever_ready: &mut bool,
    ) -> EngineResult<()> {
        while let Some(frame) = read.next().await {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let msg = frame.map_err(|e| EngineError::backend(e.to_string()))?;
            let text = match msg {
                WsMessage::Text(t) => t,
                WsMessage::Close(_) => return Err(EngineError::backend("gateway closed")),
                _ => continue,
            };
            let payload: GatewayPayload = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(s) = payload.s {
                let _ = seq_tx.try_send(Some(s));
            }
            match payload.op {
                0 => {
                    let event = payload.t.as_deref().unwrap_or("");
                    let data = payload.d.unwrap_or(Value::Null);
                    if event == "READY" {
                        *ever_ready = true;
                    }
                    self.dispatch(event, data).await;
                }
                7 => return Err(EngineError::backend("gateway requested reconnect")),
                9 => return Err(EngineError::backend("invalid session")),
                11 => {} // heartbeat ACK
                _ => {}
            }
        }
        Err(EngineError::backend("gateway stream ended"))
    }

    /// Convert a dispatch frame into engine context and fan it out.
    async fn dispatch(&self, event: &str, data: Value) {
        match event {
            "READY" => {
                if let Some(app_id) = data["application"]["id"].as_str() {
                    let _ = self.client.application_id.set(app_id.to_string());
                }
                if let Some(user) = data["user"].as_object() {
                    let name = user.get("username").and_then(Value::as_str).unwrap_or("?");
                    let id = user.get("id").and_then(Value::as_str).unwrap_or_default();
                    let _ = self.client.bot_user_id.set(id.to_string());
                    info!("[gateway] Ready as {name} ({id})");
                }
                self.engine.handle_event("gateway_ready", json!({})).await;
            }
            "MESSAGE_CREATE" => {
                if data["author"]["bot"].as_bool().unwrap_or(false) {
                    return;
                }
                let ctx = json!({
                    "content": data["content"],
                    "user": data["author"],
                    "channel": {"id": data["channel_id"]},
                    "guild": {"id": data["guild_id"]},
                    "member": data["member"],
                    "attachments": data["attachments"],
                    "message": data,
                });
                self.engine.handle_message(ctx).await;
            }
            "MESSAGE_UPDATE" | "MESSAGE_DELETE" => {
                let name = if event == "MESSAGE_UPDATE" { "message_update" } else { "message_delete" };
                let ctx = json!({
                    "channel": {"id": data["channel_id"]},
                    "guild": {"id": data["guild_id"]},
                    "message": data,
                });
                self.engine.handle_event(name, ctx).await;
            }
            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_REMOVE" | "GUILD_MEMBER_UPDATE" => {
                let name = match event {
                    "GUILD_MEMBER_ADD" => "guild_member_add",
                    "GUILD_MEMBER_REMOVE" => "guild_member_remove",
                    _ => "guild_member_update",
                };
                let ctx = json!({
                    "user": data["user"],
                    "guild": {"id": data["guild_id"]},
                    "member": data,
                });
                self.engine.handle_event(name, ctx).await;
            }
            "MESSAGE_REACTION_ADD" | "MESSAGE_REACTION_REMOVE" => {
                let name = if event == "MESSAGE_REACTION_ADD" {
                    "message_reaction_add"
                } else {
                    "message_reaction_remove"
                };
                let ctx = json!({
                    "user": {"id": data["user_id"]},
                    "channel": {"id": data["channel_id"]},
                    "guild": {"id": data["guild_id"]},
                    "reaction": data,
                });
                self.engine.handle_event(name, ctx).await;
            }
            "VOICE_STATE_UPDATE" => {
                let ctx = json!({
                    "user": {"id": data["user_id"]},
                    "guild": {"id": data["guild_id"]},
                    "voice_state": data,
                });
                self.engine.handle_event("voice_state_update", ctx).await;
            }
            "PRESENCE_UPDATE" => {
                let ctx = json!({
                    "user": data["user"],
                    "guild": {"id": data["guild_id"]},
                    "presence": data,
                });
                self.engine.handle_event("presence_update", ctx).await;
            }
            "INTERACTION_CREATE" => self.dispatch_interaction(data).await,
            other => {
                debug!("[gateway] Ignoring event {other}");
            }
        }
    }

    async fn dispatch_interaction(&self, data: Value) {
        let id = data["id"].as_str().unwrap_or_default().to_string();
        let token = data["token"].as_str().unwrap_or_default().to_string();
        let mut handle = InteractionHandle::new(id, token);
        handle.channel_id = data["channel_id"].as_str().unwrap_or_default().to_string();
        handle.guild_id = data["guild_id"].as_str().map(str::to_string);

        let user = if data["member"]["user"].is_object() {
            data["member"]["user"].clone()
        } else {
            data["user"].clone()
        };
        let base = json!({
            "user": user,
            "member": data["member"],
            "channel": {"id": data["channel_id"]},
            "guild": {"id": data["guild_id"]},
            "interaction": {"id": data["id"], "type": data["type"]},
        });

        match data["type"].as_u64().unwrap_or(0) {
            // Application command (slash or context menu).
            2 => {
                let name = data["data"]["name"].as_str().unwrap_or_default().to_string();
                let command_type = data["data"]["type"].as_u64().unwrap_or(1);
                if command_type == 2 || command_type == 3 {
                    let kind = if command_type == 3 {
                        InteractionKind::MessageMenu
                    } else {
                        InteractionKind::UserMenu
                    };
                    let mut ctx = base.clone();
                    ctx["target"] = data["data"]["resolved"].clone();
                    self.engine.handle_interaction(kind, &name, ctx, handle).await;
                    return;
                }
                let (subcommand, args) = parse_command_options(&data["data"]);
                let mut ctx = base.clone();
                ctx["args"] = Value::Object(args);
                let handled = self
                    .engine
                    .handle_command(&name, subcommand.as_deref(), ctx, handle)
                    .await;
                if !handled {
                    warn!("[gateway] No handler for command /{name}");
                }
            }
            // Message component.
            3 => {
                let custom_id = data["data"]["custom_id"].as_str().unwrap_or_default().to_string();
                let component_type = data["data"]["component_type"].as_u64().unwrap_or(2);
                let kind = if component_type == 2 {
                    InteractionKind::Button
                } else {
                    InteractionKind::Select
                };
                let mut ctx = base.clone();
                ctx["custom_id"] = json!(custom_id);
                ctx["values"] = data["data"]["values"].clone();
                self.engine.handle_interaction(kind, &custom_id, ctx, handle).await;
            }
            // Modal submit.
            5 => {
                let custom_id = data["data"]["custom_id"].as_str().unwrap_or_default().to_string();
                let mut fields = Map::new();
                for row in data["data"]["components"].as_array().into_iter().flatten() {
                    for input in row["components"].as_array().into_iter().flatten() {
                        if let (Some(id), Some(value)) =
                            (input["custom_id"].as_str(), input["value"].as_str())
                        {
                            fields.insert(id.to_string(), json!(value));
                        }
                    }
                }
                let mut ctx = base.clone();
                ctx["custom_id"] = json!(custom_id);
                ctx["fields"] = Value::Object(fields);
                self.engine.handle_interaction(InteractionKind::Modal, &custom_id, ctx, handle).await;
            }
            other => {
                debug!("[gateway] Ignoring interaction type {other}");
            }
        }
    }
}

/// Flatten slash-command options into (subcommand, args). Option values keep
/// their wire types.
fn parse_command_options(data: &Value) -> (Option<String>, Map<String, Value>) {
    let mut args = Map::new();
    let mut subcommand = None;
    let options = data["options"].as_array().cloned().unwrap_or_default();
    let mut queue = options;
    while let Some(option) = queue.pop() {
        let opt_type = option["type"].as_u64().unwrap_or(3);
        if opt_type == 1 || opt_type == 2 {
            if let Some(name) = option["name"].as_str() {
                subcommand = Some(name.to_string());
            }
            queue.extend(option["options"].as_array().cloned().unwrap_or_default());
            continue;
        }
        if let Some(name) = option["name"].as_str() {
            args.insert(name.to_string(), option["value"].clone());
        }
    }
    (subcommand, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_respects_lines_and_limit() {
        assert_eq!(split_message("short", 100), vec!["short".to_string()]);
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_message(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 80));
        // One oversized line hard-splits.
        let long = "x".repeat(250);
        let chunks = split_message(&long, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
    }

    #[test]
    fn command_option_parsing_flattens_subcommands() {
        let data = json!({
            "name": "admin",
            "options": [{
                "name": "purge",
                "type": 1,
                "options": [
                    {"name": "count", "type": 4, "value": 5},
                    {"name": "silent", "type": 5, "value": true},
                ],
            }],
        });
        let (sub, args) = parse_command_options(&data);
        assert_eq!(sub.as_deref(), Some("purge"));
        assert_eq!(args["count"], json!(5));
        assert_eq!(args["silent"], json!(true));
    }

    #[test]
    fn plain_options_have_no_subcommand() {
        let data = json!({
            "options": [{"name": "text", "type": 3, "value": "hi"}],
        });
        let (sub, args) = parse_command_options(&data);
        assert!(sub.is_none());
        assert_eq!(args["text"], json!("hi"));
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let early = reconnect_delay(0);
        assert!(early >= Duration::from_millis(750) && early <= Duration::from_millis(1250));
        let late = reconnect_delay(30);
        assert!(late <= Duration::from_millis(MAX_RECONNECT_DELAY_MS + MAX_RECONNECT_DELAY_MS / 4));
        assert!(late >= Duration::from_millis(MAX_RECONNECT_DELAY_MS - MAX_RECONNECT_DELAY_MS / 4));
    }
}
