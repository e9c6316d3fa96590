// Weft Engine — Action context
//
// The mutable bag of named values an executing action sees, plus the
// cancellation signal checked between steps. One context per event emission
// or interaction; flows extend it with their resolved arguments.

use crate::engine::client::InteractionHandle;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation: the flow loop checks this before each step. The
/// running step completes; nothing after it starts.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A synthetic event pushed back into the router (from `emit`, timers, the
/// scheduler, voice track-end).
#[derive(Debug, Clone)]
pub struct SyntheticEvent {
    pub name: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct ActionContext {
    /// Named values visible to expression evaluation.
    pub values: Map<String, Value>,
    pub cancel: CancelSignal,
    /// Present while handling an interaction; carries the dedupe flags.
    pub interaction: Option<InteractionHandle>,
}

impl ActionContext {
    pub fn new(values: Map<String, Value>) -> Self {
        ActionContext { values, cancel: CancelSignal::new(), interaction: None }
    }

    pub fn empty() -> Self {
        Self::new(Map::new())
    }

    pub fn with_interaction(mut self, handle: InteractionHandle) -> Self {
        self.interaction = Some(handle);
        self
    }

    /// Set a named value, replacing any previous one.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> &Value {
        self.values.get(key).unwrap_or(&Value::Null)
    }

    /// Dot-path lookup across the whole context.
    pub fn get_path(&self, path: &str) -> Value {
        let root = Value::Object(self.values.clone());
        crate::engine::expr::value::get_path(&root, path).clone()
    }

    /// Scope key for debounce/throttle windows and automod histories:
    /// guild + channel + user.
    pub fn scope_key(&self) -> String {
        let id = |path: &str| {
            let v = self.get_path(path);
            crate::engine::expr::value::to_display_string(&v)
        };
        format!("{}:{}:{}", id("guild.id"), id("channel.id"), id("user.id"))
    }
}

/// Outcome of one action. Failures carry the message; `executeSequence`
/// collects these without aborting.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub skipped: bool,
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        ActionResult { success: true, output, error: None, skipped: false }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ActionResult { success: false, output: Value::Null, error: Some(error.into()), skipped: false }
    }

    pub fn skipped() -> Self {
        ActionResult { success: true, output: Value::Null, error: None, skipped: true }
    }
}
