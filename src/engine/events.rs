// Weft Engine — Event Router
//
// Handlers subscribe to canonical event names; platform aliases normalize
// on both registration and emission (`message` ≡ `message_create`,
// `member_join` ≡ `guild_member_add`, …). On emission each subscribed
// handler runs in registration order: `when` guard, debounce/throttle
// windows keyed by guild+channel+user, then the handler's actions through
// the flow engine. One failing handler never blocks the rest.

use crate::engine::context::ActionContext;
use crate::engine::flow::FlowEngine;
use crate::engine::spec::EventHandlerSpec;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Normalize an event name to its canonical platform form. Synthetic names
/// pass through untouched.
pub fn canonical_event(name: &str) -> String {
    match name {
        "message" => "message_create",
        "message_edit" => "message_update",
        "member_join" => "guild_member_add",
        "member_leave" | "member_remove" => "guild_member_remove",
        "member_update" => "guild_member_update",
        "reaction_add" => "message_reaction_add",
        "reaction_remove" => "message_reaction_remove",
        "voice_update" => "voice_state_update",
        other => other,
    }
    .to_string()
}

pub struct EventRouter {
    // event name → handlers in registration order; replaced wholesale on
    // re-register.
    handlers: RwLock<HashMap<String, Vec<Arc<EventHandlerSpec>>>>,
    // (handler identity + scope key) → last observation, for debounce and
    // throttle windows.
    debounce_seen: Mutex<HashMap<String, Instant>>,
    throttle_fired: Mutex<HashMap<String, Instant>>,
}

impl EventRouter {
    pub fn new() -> Self {
        EventRouter {
            handlers: RwLock::new(HashMap::new()),
            debounce_seen: Mutex::new(HashMap::new()),
            throttle_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Replace all subscriptions with the given handler set.
    pub fn register_all(&self, specs: &[EventHandlerSpec]) {
        let mut map: HashMap<String, Vec<Arc<EventHandlerSpec>>> = HashMap::new();
        for spec in specs {
            map.entry(canonical_event(&spec.event)).or_default().push(Arc::new(spec.clone()));
        }
        *self.handlers.write() = map;
    }

    pub fn subscribe(&self, spec: EventHandlerSpec) {
        self.handlers.write().entry(canonical_event(&spec.event)).or_default().push(Arc::new(spec));
    }

    pub fn subscribed_events(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Debounce: the first observation fires; repeats inside the window are
    /// suppressed and push the window out (classic trailing suppression).
    fn debounce_allows(&self, key: &str, window_ms: u64) -> bool {
        let mut seen = self.debounce_seen.lock();
        let now = Instant::now();
        let allowed = match seen.get(key) {
            Some(last) => now.duration_since(*last) >= Duration::from_millis(window_ms),
            None => true,
        };
        seen.insert(key.to_string(), now);
        allowed
    }

    /// Throttle: at most one fire per window; extras drop silently without
    /// extending the window.
    fn throttle_allows(&self, key: &str, window_ms: u64) -> bool {
        let mut fired = self.throttle_fired.lock();
        let now = Instant::now();
        match fired.get(key) {
            Some(last) if now.duration_since(*last) < Duration::from_millis(window_ms) => false,
            _ => {
                fired.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Fan an event out to its handlers. Returns how many handler action
    /// lists actually ran.
    pub async fn emit(&self, event: &str, ctx: &ActionContext, flow: &FlowEngine) -> usize {
        let name = canonical_event(event);
        let subscribed = self.handlers.read().get(&name).cloned().unwrap_or_default();
        if subscribed.is_empty() {
            return 0;
        }
        log::debug!("[events] {name}: {} handler(s)", subscribed.len());

        let mut ran = 0;
        for (index, handler) in subscribed.iter().enumerate() {
            let mut handler_ctx = ctx.clone();
            handler_ctx.set("event", serde_json::Value::String(name.clone()));

            if let Some(when) = &handler.when {
                if !flow.guard_passes(when, &handler_ctx).await {
                    continue;
                }
            }

            let window_key = format!("{name}#{index}@{}", ctx.scope_key());
            if let Some(d) = handler.debounce {
                if !self.debounce_allows(&window_key, d) {
                    continue;
                }
            }
            if let Some(t) = handler.throttle {
                if !self.throttle_allows(&window_key, t) {
                    continue;
                }
            }

            // A failing handler logs inside the flow walk and never stops
            // the remaining handlers.
            flow.run_actions(&handler.actions, &mut handler_ctx).await;
            ran += 1;
        }
        ran
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builders::TemplateRegistry;
    use crate::engine::client::NullClient;
    use crate::engine::executor::Executor;
    use crate::engine::spec::parse_spec;
    use crate::engine::state::StateManager;
    use crate::engine::storage::memory::MemoryStorage;
    use crate::engine::timers::TimerManager;
    use crate::engine::voice::{NullVoiceBackend, VoiceManager};
    use serde_json::json;

    fn flow_engine() -> (FlowEngine, Arc<NullClient>) {
        let doc = parse_spec("{}").unwrap();
        let client = Arc::new(NullClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let (events_tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = Arc::new(Executor {
            client: client.clone(),
            storage: storage.clone(),
            state: Arc::new(StateManager::new(storage, &doc.state)),
            voice: Arc::new(VoiceManager::new(Arc::new(NullVoiceBackend::default()), 100, 100)),
            timers: Arc::new(TimerManager::new(events_tx.clone())),
            templates: Arc::new(TemplateRegistry::from_spec(&doc.components)),
            events_tx,
        });
        (FlowEngine::new(executor, doc.engine.clone()), client)
    }

    fn handlers(yaml: &str) -> Vec<EventHandlerSpec> {
        parse_spec(yaml).unwrap().events
    }

    fn msg_ctx(user: &str) -> ActionContext {
        let mut ctx = ActionContext::empty();
        ctx.set("guild", json!({"id": "g"}));
        ctx.set("channel", json!({"id": "c"}));
        ctx.set("user", json!({"id": user}));
        ctx
    }

    #[test]
    fn aliases_normalize() {
        assert_eq!(canonical_event("message"), "message_create");
        assert_eq!(canonical_event("member_join"), "guild_member_add");
        assert_eq!(canonical_event("reaction_add"), "message_reaction_add");
        assert_eq!(canonical_event("scheduler_tick"), "scheduler_tick");
    }

    #[tokio::test]
    async fn alias_subscription_receives_canonical_emission() {
        let (flow, client) = flow_engine();
        let router = EventRouter::new();
        router.register_all(&handlers(
            r#"
events:
  message: [{send_message: {channel: c, content: "got it"}}]
"#,
        ));
        let ran = router.emit("message_create", &msg_ctx("u"), &flow).await;
        assert_eq!(ran, 1);
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_survive_failures() {
        let (flow, client) = flow_engine();
        let router = EventRouter::new();
        router.register_all(&handlers(
            r#"
events:
  - event: ping
    actions: [{kick: {}}]          # fails: nothing in context
  - event: ping
    actions: [{send_message: {channel: c, content: "second"}}]
"#,
        ));
        let ran = router.emit("ping", &msg_ctx("u"), &flow).await;
        assert_eq!(ran, 2);
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn when_guard_filters_handlers() {
        let (flow, client) = flow_engine();
        let router = EventRouter::new();
        router.register_all(&handlers(
            r#"
events:
  - event: ping
    when: "user.id == 'vip'"
    actions: [{send_message: {channel: c, content: "vip only"}}]
"#,
        ));
        assert_eq!(router.emit("ping", &msg_ctx("pleb"), &flow).await, 0);
        assert_eq!(router.emit("ping", &msg_ctx("vip"), &flow).await, 1);
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn debounce_suppresses_rapid_refires() {
        let (flow, _) = flow_engine();
        let router = EventRouter::new();
        router.register_all(&handlers(
            r#"
events:
  - event: ping
    debounce: 5000
    actions: [{log: {message: fired}}]
"#,
        ));
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 1);
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 0);
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 0);
        // A different user owns a different window.
        assert_eq!(router.emit("ping", &msg_ctx("other"), &flow).await, 1);
    }

    #[tokio::test]
    async fn throttle_allows_one_per_window() {
        let (flow, _) = flow_engine();
        let router = EventRouter::new();
        router.register_all(&handlers(
            r#"
events:
  - event: ping
    throttle: 50
    actions: [{log: {message: fired}}]
"#,
        ));
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 1);
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 0);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(router.emit("ping", &msg_ctx("u"), &flow).await, 1);
    }
}
