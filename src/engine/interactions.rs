// Weft Engine — Interaction Dispatcher
//
// Six channels: chat commands, buttons, select menus, modals, and the two
// context-menu kinds. Component custom IDs support trailing-`*` wildcards:
// exact match first, then the first registered wildcard whose prefix fits.
// Handler failures answer the interaction with one generic ephemeral reply,
// and only when nothing else has replied or deferred it.

use crate::engine::client::OutgoingMessage;
use crate::engine::context::ActionContext;
use crate::engine::flow::FlowEngine;
use crate::engine::spec::Action;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const GENERIC_ERROR_REPLY: &str = "An error occurred while processing this interaction.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Command,
    Button,
    Select,
    Modal,
    UserMenu,
    MessageMenu,
}

struct Route {
    key: String,
    actions: Arc<Vec<Action>>,
}

pub struct InteractionDispatcher {
    // Registration order is preserved per kind: wildcard lookup takes the
    // first registered match.
    routes: RwLock<HashMap<InteractionKind, Vec<Route>>>,
}

impl InteractionDispatcher {
    pub fn new() -> Self {
        InteractionDispatcher { routes: RwLock::new(HashMap::new()) }
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }

    pub fn register(&self, kind: InteractionKind, key: impl Into<String>, actions: Vec<Action>) {
        self.routes
            .write()
            .entry(kind)
            .or_default()
            .push(Route { key: key.into(), actions: Arc::new(actions) });
    }

    pub fn registered_keys(&self, kind: InteractionKind) -> Vec<String> {
        self.routes
            .read()
            .get(&kind)
            .map(|routes| routes.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Exact match, then first-registered trailing-`*` wildcard.
    pub fn lookup(&self, kind: InteractionKind, id: &str) -> Option<Arc<Vec<Action>>> {
        let routes = self.routes.read();
        let routes = routes.get(&kind)?;
        if let Some(route) = routes.iter().find(|r| r.key == id) {
            return Some(Arc::clone(&route.actions));
        }
        routes
            .iter()
            .find(|r| {
                r.key
                    .strip_suffix('*')
                    .map(|prefix| id.starts_with(prefix))
                    .unwrap_or(false)
            })
            .map(|r| Arc::clone(&r.actions))
    }

    /// Route an interaction to its handler and run it. Returns false when no
    /// handler matched. The context must carry the interaction handle.
    pub async fn dispatch(
        &self,
        kind: InteractionKind,
        id: &str,
        ctx: &mut ActionContext,
        flow: &FlowEngine,
    ) -> bool {
        let Some(actions) = self.lookup(kind, id) else {
            log::debug!("[interactions] No handler for {kind:?} '{id}'");
            return false;
        };

        let results = flow.run_actions(&actions, ctx).await;
        let failed = results.iter().any(|r| !r.success);
        if failed {
            if let Some(interaction) = &ctx.interaction {
                if interaction.is_unanswered() {
                    let reply = OutgoingMessage {
                        content: Some(GENERIC_ERROR_REPLY.to_string()),
                        ephemeral: true,
                        ..Default::default()
                    };
                    if flow.executor.client.reply_interaction(interaction, &reply).await.is_ok() {
                        interaction.mark_replied();
                    }
                }
            }
        }
        true
    }
}

impl Default for InteractionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builders::TemplateRegistry;
    use crate::engine::client::{InteractionHandle, NullClient};
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

    fn reply_actions(text: &str) -> Vec<Action> {
        let yaml = format!("- reply: {{content: \"{text}\"}}");
        let mut v: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        crate::engine::normalize::normalize_actions(&mut v).unwrap();
        Action::list(Some(&v)).unwrap()
    }

    #[test]
    fn wildcard_lookup_prefers_exact_then_first_registered() {
        let dispatcher = InteractionDispatcher::new();
        dispatcher.register(InteractionKind::Button, "vote_*", reply_actions("wild one"));
        dispatcher.register(InteractionKind::Button, "vote_yes", reply_actions("exact"));
        dispatcher.register(InteractionKind::Button, "vote_y*", reply_actions("wild two"));

        // Exact beats both wildcards.
        assert!(dispatcher.lookup(InteractionKind::Button, "vote_yes").is_some());
        // First registered wildcard wins for the rest.
        let via_wild = dispatcher.lookup(InteractionKind::Button, "vote_no").unwrap();
        assert_eq!(via_wild.len(), 1);
        // Kinds are separate namespaces.
        assert!(dispatcher.lookup(InteractionKind::Select, "vote_yes").is_none());
        assert!(dispatcher.lookup(InteractionKind::Button, "other").is_none());
    }

    #[tokio::test]
    async fn dispatch_runs_matching_handler() {
        let (flow, client) = flow_engine();
        let dispatcher = InteractionDispatcher::new();
        dispatcher.register(InteractionKind::Command, "echo", reply_actions("You said: ${args.text}"));

        let mut ctx = ActionContext::empty().with_interaction(InteractionHandle::new("i1", "tok"));
        ctx.set("args", json!({"text": "Hello World"}));
        assert!(dispatcher.dispatch(InteractionKind::Command, "echo", &mut ctx, &flow).await);

        let replies = client.calls_named("reply_interaction");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].args["msg"]["content"], json!("You said: Hello World"));
    }

    #[tokio::test]
    async fn handler_failure_sends_one_generic_reply() {
        let (flow, client) = flow_engine();
        let dispatcher = InteractionDispatcher::new();
        // kick with an empty context fails.
        let yaml = "- kick: {}";
        let mut v: serde_json::Value = serde_yaml::from_str(yaml).unwrap();
        crate::engine::normalize::normalize_actions(&mut v).unwrap();
        dispatcher.register(InteractionKind::Command, "boom", Action::list(Some(&v)).unwrap());

        let mut ctx = ActionContext::empty().with_interaction(InteractionHandle::new("i2", "tok"));
        dispatcher.dispatch(InteractionKind::Command, "boom", &mut ctx, &flow).await;

        let replies = client.calls_named("reply_interaction");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].args["msg"]["content"], json!(GENERIC_ERROR_REPLY));
        assert_eq!(replies[0].args["msg"]["ephemeral"], json!(true));
    }

    #[tokio::test]
    async fn no_generic_reply_after_handler_already_replied() {
        let (flow, client) = flow_engine();
        let dispatcher = InteractionDispatcher::new();
        // Replies first, then fails.
        let yaml = r#"
- reply: {content: "done"}
- kick: {}
"#;
        let mut v: serde_json::Value = serde_yaml::from_str(yaml).unwrap();
        crate::engine::normalize::normalize_actions(&mut v).unwrap();
        dispatcher.register(InteractionKind::Command, "half", Action::list(Some(&v)).unwrap());

        let mut ctx = ActionContext::empty().with_interaction(InteractionHandle::new("i3", "tok"));
        dispatcher.dispatch(InteractionKind::Command, "half", &mut ctx, &flow).await;

        let replies = client.calls_named("reply_interaction");
        // Only the handler's own reply; no generic error on top.
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].args["msg"]["content"], json!("done"));
    }

    #[tokio::test]
    async fn unmatched_interaction_reports_false() {
        let (flow, _) = flow_engine();
        let dispatcher = InteractionDispatcher::new();
        let mut ctx = ActionContext::empty();
        assert!(!dispatcher.dispatch(InteractionKind::Modal, "ghost", &mut ctx, &flow).await);
    }
}
