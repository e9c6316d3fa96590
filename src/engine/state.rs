// Weft Engine — Scoped state manager
//
// Declared variables live in storage under scope-composed keys:
//
//   global:{name}
//   guild:{guild_id}:{name}
//   channel:{channel_id}:{name}
//   user:{user_id}:{name}
//   member:{guild_id}:{user_id}:{name}
//
// `get` falls back to the declared default. The flow engine folds every
// declared variable into the evaluator context before conditions run, so
// `when: warn_count >= 3` reads naturally.

use crate::atoms::error::EngineResult;
use crate::engine::context::ActionContext;
use crate::engine::expr;
use crate::engine::spec::{StateSpec, VariableScope, VariableSpec};
use crate::engine::storage::{StorageAdapter, StoredValue};
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct StateManager {
    storage: Arc<dyn StorageAdapter>,
    variables: Vec<(String, VariableSpec)>,
}

impl StateManager {
    pub fn new(storage: Arc<dyn StorageAdapter>, state: &StateSpec) -> Self {
        let variables = state
            .variables
            .keys()
            .filter_map(|name| state.variable(name).map(|spec| (name.clone(), spec)))
            .collect();
        StateManager { storage, variables }
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.iter().map(|(name, _)| name.clone()).collect()
    }

    fn spec_for(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|(n, _)| n == name).map(|(_, spec)| spec)
    }

    /// Compose the storage key for a variable in the calling context.
    /// Undeclared names are treated as global.
    pub fn storage_key(&self, name: &str, ctx: &ActionContext) -> String {
        let scope = self.spec_for(name).map(|s| s.scope).unwrap_or(VariableScope::Global);
        let id = |path: &str| expr::value::to_display_string(&ctx.get_path(path));
        match scope {
            VariableScope::Global => format!("global:{name}"),
            VariableScope::Guild => format!("guild:{}:{name}", id("guild.id")),
            VariableScope::Channel => format!("channel:{}:{name}", id("channel.id")),
            VariableScope::User => format!("user:{}:{name}", id("user.id")),
            VariableScope::Member => {
                format!("member:{}:{}:{name}", id("guild.id"), id("user.id"))
            }
        }
    }

    /// Read a variable, falling back to its declared default.
    pub async fn get(&self, name: &str, ctx: &ActionContext) -> EngineResult<Value> {
        let key = self.storage_key(name, ctx);
        match self.storage.get(&key).await? {
            Some(stored) => Ok(stored.value),
            None => Ok(self.spec_for(name).map(|s| s.default.clone()).unwrap_or(Value::Null)),
        }
    }

    pub async fn set(&self, name: &str, ctx: &ActionContext, value: Value) -> EngineResult<()> {
        let key = self.storage_key(name, ctx);
        self.storage.set(&key, StoredValue::new(value)).await
    }

    /// Add `by` to a numeric variable and return the new value. Non-numeric
    /// stored values restart from zero.
    pub async fn increment(&self, name: &str, ctx: &ActionContext, by: f64) -> EngineResult<Value> {
        let current = self.get(name, ctx).await?;
        let base = expr::value::as_number(&current).unwrap_or(0.0);
        let next = expr::value::number(base + by);
        self.set(name, ctx, next.clone()).await?;
        Ok(next)
    }

    /// Fold every declared variable for the calling scope into an evaluator
    /// context, under its own name. Existing context keys win.
    pub async fn fold_into(
        &self,
        values: &Map<String, Value>,
        ctx: &ActionContext,
    ) -> EngineResult<Map<String, Value>> {
        let mut merged = values.clone();
        for (name, _) in &self.variables {
            if merged.contains_key(name) {
                continue;
            }
            let v = self.get(name, ctx).await?;
            merged.insert(name.clone(), v);
        }
        Ok(merged)
    }

    /// State-aware evaluation: declared variables are visible by name.
    pub async fn evaluate_with_state(
        &self,
        expr_text: &str,
        ctx: &ActionContext,
    ) -> EngineResult<Value> {
        let merged = self.fold_into(&ctx.values, ctx).await?;
        expr::evaluate(expr_text, &merged)
    }
}
