// Weft Engine — Runtime wiring
//
// Owns every subsystem built from one spec document: storage tables, the
// executor and flow engine, event router, interaction dispatcher, cron
// scheduler, automod, voice, timers. Incoming platform events and
// interactions enter here; synthetic events (emit, timers, scheduler ticks,
// voice track-end) come back through one queue and re-enter the router.
//
// Registries are built once from the spec; `reload` replaces them wholesale.

use crate::atoms::error::EngineResult;
use crate::engine::automod::AutomodEngine;
use crate::engine::builders::{TemplateKind, TemplateRegistry};
use crate::engine::client::{InteractionHandle, PlatformClient};
use crate::engine::context::{ActionContext, SyntheticEvent};
use crate::engine::events::EventRouter;
use crate::engine::executor::Executor;
use crate::engine::flow::FlowEngine;
use crate::engine::interactions::{InteractionDispatcher, InteractionKind};
use crate::engine::spec::{Action, CommandSpec, SpecDocument};
use crate::engine::state::StateManager;
use crate::engine::scheduler::CronScheduler;
use crate::engine::storage::StorageAdapter;
use crate::engine::timers::TimerManager;
use crate::engine::voice::{VoiceBackend, VoiceManager};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Slash-command option type → wire integer.
fn option_type_code(name: &str) -> u8 {
    match name {
        "subcommand" => 1,
        "subcommand_group" => 2,
        "integer" | "int" => 4,
        "boolean" => 5,
        "user" => 6,
        "channel" => 7,
        "role" => 8,
        "mentionable" => 9,
        "number" => 10,
        "attachment" => 11,
        _ => 3, // string
    }
}

/// Presence activity type → wire integer.
fn activity_type_code(name: &str) -> u8 {
    match name.to_ascii_lowercase().as_str() {
        "streaming" => 1,
        "listening" => 2,
        "watching" => 3,
        "competing" => 5,
        _ => 0, // playing
    }
}

pub struct Engine {
    pub doc: Arc<SpecDocument>,
    pub flow: Arc<FlowEngine>,
    pub router: Arc<EventRouter>,
    pub interactions: Arc<InteractionDispatcher>,
    pub scheduler: Arc<CronScheduler>,
    pub automod: Arc<AutomodEngine>,
    events_rx: Mutex<Option<UnboundedReceiver<SyntheticEvent>>>,
}

impl Engine {
    /// Build an engine from a parsed document and its collaborators.
    /// Declared tables are created (idempotently) before anything runs.
    pub async fn new(
        doc: SpecDocument,
        client: Arc<dyn PlatformClient>,
        storage: Arc<dyn StorageAdapter>,
        voice_backend: Arc<dyn VoiceBackend>,
    ) -> EngineResult<Self> {
        for def in doc.state.table_definitions()? {
            storage.create_table(&def).await?;
        }

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let voice_cfg = doc.voice.clone().unwrap_or_default();
        let executor = Arc::new(Executor {
            client,
            storage: storage.clone(),
            state: Arc::new(StateManager::new(storage, &doc.state)),
            voice: Arc::new(VoiceManager::new(
                voice_backend,
                voice_cfg.max_queue_size,
                voice_cfg.default_volume,
            )),
            timers: Arc::new(TimerManager::new(events_tx.clone())),
            templates: Arc::new(TemplateRegistry::from_spec(&doc.components)),
            events_tx,
        });

        let flow = Arc::new(FlowEngine::new(executor, doc.engine.clone()));
        let engine = Engine {
            flow,
            router: Arc::new(EventRouter::new()),
            interactions: Arc::new(InteractionDispatcher::new()),
            scheduler: Arc::new(CronScheduler::new(
                doc.scheduler.timezone.as_deref().unwrap_or(doc.engine.scheduler_timezone.as_str()),
            )),
            automod: Arc::new(AutomodEngine::new()),
            events_rx: Mutex::new(Some(events_rx)),
            doc: Arc::new(doc),
        };
        engine.register_from_spec();
        Ok(engine)
    }

    /// (Re)build every registry from the held document.
    fn register_from_spec(&self) {
        let doc = &self.doc;
        self.flow.register_flows(&doc.flows);
        self.router.register_all(&doc.events);
        self.scheduler.register_jobs(&doc.scheduler.jobs);
        self.automod.register_rules(&doc.automod.rules);

        self.interactions.clear();
        for command in &doc.commands {
            self.interactions.register(
                InteractionKind::Command,
                command.name.clone(),
                command.actions.clone(),
            );
            for sub in &command.subcommands {
                self.interactions.register(
                    InteractionKind::Command,
                    format!("{}/{}", command.name, sub.name),
                    sub.actions.clone(),
                );
            }
        }
        for menu in &doc.context_menus {
            let kind = if menu.menu_type == "message" {
                InteractionKind::MessageMenu
            } else {
                InteractionKind::UserMenu
            };
            self.interactions.register(kind, menu.name.clone(), menu.actions.clone());
        }
        for (kind, registry_kind) in [
            (TemplateKind::Button, InteractionKind::Button),
            (TemplateKind::Select, InteractionKind::Select),
            (TemplateKind::Modal, InteractionKind::Modal),
        ] {
            let templates = self.flow.executor.templates.clone();
            for (name, template) in templates.entries(kind) {
                let actions = template
                    .get("actions")
                    .map(|v| Action::list(Some(v)))
                    .transpose()
                    .unwrap_or_else(|e| {
                        log::error!("[runtime] Template '{name}' actions rejected: {e}");
                        None
                    })
                    .unwrap_or_default();
                if actions.is_empty() {
                    continue;
                }
                let key = template
                    .get("custom_id")
                    .or_else(|| template.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or(name);
                self.interactions.register(registry_kind, key.to_string(), actions);
            }
        }
    }

    // ── Startup ────────────────────────────────────────────────────────

    /// Register commands and presence with the platform, start the
    /// scheduler tick loop and the synthetic-event pump, and emit `ready`.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let client = &self.flow.executor.client;

        let global: Vec<Value> =
            self.doc.commands.iter().filter(|c| c.guild.is_none()).map(command_payload).collect();
        let mut menus: Vec<Value> = self
            .doc
            .context_menus
            .iter()
            .map(|m| {
                json!({
                    "name": m.name,
                    "type": if m.menu_type == "message" { 3 } else { 2 },
                })
            })
            .collect();
        let mut all_global = global;
        all_global.append(&mut menus);
        if !all_global.is_empty() {
            client.register_commands(&all_global, None).await?;
            log::info!("[runtime] Registered {} global command(s)", all_global.len());
        }
        for command in self.doc.commands.iter().filter(|c| c.guild.is_some()) {
            let payload = vec![command_payload(command)];
            client.register_commands(&payload, command.guild.as_deref()).await?;
        }

        if let Some(presence) = &self.doc.presence {
            client.set_presence(&presence_payload(presence)).await?;
        }

        self.scheduler.clone().start(self.flow.clone(), ActionContext::empty());
        self.start_event_pump();
        self.handle_event("ready", json!({})).await;
        Ok(())
    }

    /// Drain the synthetic-event queue into the router, one task per
    /// emission.
    fn start_event_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.events_rx.lock().take() else { return };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.handle_synthetic(event).await;
                });
            }
        });
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        self.flow.executor.timers.clear();
    }

    // ── Event entry points ─────────────────────────────────────────────

    fn ctx_from(data: Value) -> ActionContext {
        let values: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
        ActionContext::new(values)
    }

    async fn handle_synthetic(&self, event: SyntheticEvent) {
        let mut values = Map::new();
        if event.name == "timer_fire" || event.data.get("expiresAt").is_some() {
            values.insert("timer".into(), event.data.clone());
        }
        if let Some(obj) = event.data.as_object() {
            for (k, v) in obj {
                values.entry(k.clone()).or_insert_with(|| v.clone());
            }
        } else if !event.data.is_null() {
            values.insert("data".into(), event.data.clone());
        }
        let ctx = ActionContext::new(values);
        self.router.emit(&event.name, &ctx, &self.flow).await;
    }

    /// Platform event fan-in (also used for synthetic emissions in tests).
    pub async fn handle_event(&self, name: &str, data: Value) -> usize {
        let ctx = Self::ctx_from(data);
        self.router.emit(name, &ctx, &self.flow).await
    }

    /// Message fan-in: automod first, then normal routing continues.
    pub async fn handle_message(&self, data: Value) -> usize {
        let ctx = Self::ctx_from(data);
        let content = crate::engine::expr::value::to_display_string(&ctx.get_path("content"));
        if self.automod.rule_count() > 0 && !content.is_empty() {
            let verdict = self.automod.check(&content, &ctx, &self.flow).await;
            if !verdict.passed {
                self.automod.execute_actions(&verdict, &ctx, &self.flow).await;
            }
        }
        self.router.emit("message_create", &ctx, &self.flow).await
    }

    /// Slash-command fan-in.
    pub async fn handle_command(
        &self,
        name: &str,
        subcommand: Option<&str>,
        data: Value,
        interaction: InteractionHandle,
    ) -> bool {
        let key = match subcommand {
            Some(sub) => format!("{name}/{sub}"),
            None => name.to_string(),
        };
        let mut ctx = Self::ctx_from(data).with_interaction(interaction);
        ctx.set("command", json!({"name": name, "subcommand": subcommand}));
        self.interactions.dispatch(InteractionKind::Command, &key, &mut ctx, &self.flow).await
    }

    /// Component / modal / context-menu fan-in.
    pub async fn handle_interaction(
        &self,
        kind: InteractionKind,
        id: &str,
        data: Value,
        interaction: InteractionHandle,
    ) -> bool {
        let mut ctx = Self::ctx_from(data).with_interaction(interaction);
        self.interactions.dispatch(kind, id, &mut ctx, &self.flow).await
    }

    /// Voice track-end fan-in from the transport: advance the queue per the
    /// loop mode, then surface a synthetic event.
    pub async fn handle_track_end(&self, guild_id: &str) {
        match self.flow.executor.voice.handle_track_end(guild_id).await {
            Ok(next) => {
                let data = json!({
                    "guild": {"id": guild_id},
                    "track": next.map(|t| json!({"title": t.title, "url": t.url})),
                });
                self.handle_event("track_end", data).await;
            }
            Err(e) => log::warn!("[runtime] Track-end handling failed for {guild_id}: {e}"),
        }
    }
}

/// Build the registration payload for one command.
fn command_payload(command: &CommandSpec) -> Value {
    let mut options: Vec<Value> = command
        .subcommands
        .iter()
        .map(|sub| {
            json!({
                "name": sub.name,
                "description": if sub.description.is_empty() { "…" } else { sub.description.as_str() },
                "type": 1,
                "options": sub.options.iter().map(option_payload).collect::<Vec<Value>>(),
            })
        })
        .collect();
    options.extend(command.options.iter().map(option_payload));
    json!({
        "name": command.name,
        "description": if command.description.is_empty() { "…" } else { command.description.as_str() },
        "options": options,
    })
}

fn option_payload(opt: &crate::engine::spec::CommandOption) -> Value {
    let mut payload = json!({
        "name": opt.name,
        "description": if opt.description.is_empty() { "…" } else { opt.description.as_str() },
        "type": option_type_code(&opt.option_type),
        "required": opt.required,
    });
    if !opt.choices.is_empty() {
        payload["choices"] = Value::Array(opt.choices.clone());
    }
    payload
}

fn presence_payload(presence: &crate::engine::spec::Presence) -> Value {
    let activities = presence
        .activity
        .as_ref()
        .map(|a| vec![json!({"name": a.name, "type": activity_type_code(&a.activity_type)})])
        .unwrap_or_default();
    json!({
        "status": presence.status,
        "activities": activities,
        "afk": false,
        "since": Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::NullClient;
    use crate::engine::spec::parse_spec;
    use crate::engine::storage::memory::MemoryStorage;
    use crate::engine::voice::NullVoiceBackend;

    async fn engine(yaml: &str) -> (Arc<Engine>, Arc<NullClient>) {
        let doc = parse_spec(yaml).unwrap();
        let client = Arc::new(NullClient::new());
        let engine = Engine::new(
            doc,
            client.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(NullVoiceBackend::default()),
        )
        .await
        .unwrap();
        (Arc::new(engine), client)
    }

    #[tokio::test]
    async fn start_registers_commands_and_presence() {
        let (engine, client) = engine(
            r#"
identity: {name: bot}
presence:
  status: idle
  activity: {type: watching, name: "the weave"}
commands:
  - name: echo
    description: Say it back
    options: [{name: text, type: string, required: true}]
    actions: [{reply: {content: "You said: ${args.text}"}}]
  - name: local
    guild: "123"
    actions: [{reply: {content: hi}}]
"#,
        )
        .await;
        engine.start().await.unwrap();

        let registrations = client.calls_named("register_commands");
        assert_eq!(registrations.len(), 2);
        assert_eq!(registrations[0].args["commands"][0]["name"], json!("echo"));
        assert_eq!(
            registrations[0].args["commands"][0]["options"][0]["type"],
            json!(3)
        );
        assert_eq!(registrations[1].args["guild_id"], json!("123"));

        let presence = client.calls_named("set_presence");
        assert_eq!(presence[0].args["status"], json!("idle"));
        assert_eq!(presence[0].args["activities"][0]["type"], json!(3));
    }

    #[tokio::test]
    async fn command_echo_end_to_end() {
        let (engine, client) = engine(
            r#"
commands:
  - name: echo
    options: [{name: text, type: string, required: true}]
    actions: [{reply: {content: "You said: ${args.text}"}}]
"#,
        )
        .await;
        let handled = engine
            .handle_command(
                "echo",
                None,
                json!({"args": {"text": "Hello World"}}),
                InteractionHandle::new("i1", "t"),
            )
            .await;
        assert!(handled);
        let replies = client.calls_named("reply_interaction");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].args["msg"]["content"], json!("You said: Hello World"));
    }

    #[tokio::test]
    async fn subcommands_route_by_composite_key() {
        let (engine, client) = engine(
            r#"
commands:
  - name: admin
    subcommands:
      - name: purge
        actions: [{reply: {content: purged}}]
"#,
        )
        .await;
        assert!(
            engine
                .handle_command("admin", Some("purge"), json!({}), InteractionHandle::new("i", "t"))
                .await
        );
        assert_eq!(
            client.calls_named("reply_interaction")[0].args["msg"]["content"],
            json!("purged")
        );
    }

    #[tokio::test]
    async fn message_runs_automod_then_routing() {
        let (engine, client) = engine(
            r#"
events:
  message_create:
    - send_message: {channel: "${channel.id}", content: "routed"}
automod:
  rules:
    - name: caps
      trigger: {type: caps}
      actions:
        - send_message: {channel: "${channel.id}", content: "flagged ${automod.rule}"}
"#,
        )
        .await;
        engine
            .handle_message(json!({
                "content": "STOP SHOUTING",
                "guild": {"id": "g"}, "channel": {"id": "c"}, "user": {"id": "u"},
            }))
            .await;
        let contents: Vec<Value> = client
            .calls_named("send_message")
            .iter()
            .map(|c| c.args["msg"]["content"].clone())
            .collect();
        // Automod actions first, then normal routing continues.
        assert_eq!(contents, vec![json!("flagged caps"), json!("routed")]);
    }

    #[tokio::test]
    async fn emit_action_feeds_back_through_router() {
        let (engine, client) = engine(
            r#"
commands:
  - name: fire
    actions: [{emit: {event: custom_ping, data: {tag: 7}}}]
events:
  custom_ping:
    - send_message: {channel: c, content: "pinged ${tag}"}
"#,
        )
        .await;
        engine.start().await.unwrap();
        engine
            .handle_command("fire", None, json!({}), InteractionHandle::new("i", "t"))
            .await;
        // The pump runs on a spawned task; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args["msg"]["content"], json!("pinged 7"));
    }

    #[tokio::test]
    async fn button_templates_register_for_dispatch() {
        let (engine, client) = engine(
            r#"
components:
  buttons:
    confirm:
      label: OK
      custom_id: confirm_btn
      actions: [{reply: {content: confirmed}}]
"#,
        )
        .await;
        let handled = engine
            .handle_interaction(
                InteractionKind::Button,
                "confirm_btn",
                json!({}),
                InteractionHandle::new("i", "t"),
            )
            .await;
        assert!(handled);
        assert_eq!(
            client.calls_named("reply_interaction")[0].args["msg"]["content"],
            json!("confirmed")
        );
    }

    #[tokio::test]
    async fn declared_tables_exist_after_new() {
        let doc = parse_spec(
            r#"
state:
  tables:
    notes:
      columns:
        id: {type: string, primary: true}
"#,
        )
        .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let _engine = Engine::new(
            doc,
            Arc::new(NullClient::new()),
            storage.clone(),
            Arc::new(NullVoiceBackend::default()),
        )
        .await
        .unwrap();
        use crate::engine::storage::{QueryOptions, StorageAdapter};
        assert!(storage.query("notes", &QueryOptions::default()).await.is_ok());
    }
}
