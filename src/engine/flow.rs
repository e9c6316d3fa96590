// Weft Engine — Flow Engine
//
// Walks normalized action trees: sequential by default, with the control
// verbs (flow_if, flow_switch, flow_while, repeat, parallel, batch, try,
// call_flow, abort, return) handled here and every leaf verb dispatched to
// the executor. Named flows are registered once at load and invoked through
// `call_flow` with typed, defaulted parameters.
//
// Failure policy: a failing action becomes a failed result and the walk
// continues, unless a surrounding `try` catches it. `abort` and `return`
// short-circuit the enclosing flow only. Depth and iteration caps bound
// runaway specs.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::context::{ActionContext, ActionResult};
use crate::engine::executor::Executor;
use crate::engine::expr;
use crate::engine::spec::{Action, ActionKind, EngineSettings, FlowSpec};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-invocation flow frame: depth for the recursion cap, plus the abort
/// and return state that short-circuits the walk.
#[derive(Debug, Default)]
struct Frame {
    depth: usize,
    aborted: bool,
    abort_reason: Option<String>,
    return_value: Option<Value>,
}

impl Frame {
    fn at_depth(depth: usize) -> Self {
        Frame { depth, ..Default::default() }
    }

    fn stop(&self) -> bool {
        self.aborted || self.return_value.is_some()
    }
}

/// Result of one flow invocation.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub success: bool,
    pub value: Value,
    pub aborted: bool,
    pub error: Option<String>,
}

pub struct FlowEngine {
    pub executor: Arc<Executor>,
    settings: EngineSettings,
    // Write-once at load; re-registration swaps the whole map.
    flows: RwLock<HashMap<String, Arc<FlowSpec>>>,
}

impl FlowEngine {
    pub fn new(executor: Arc<Executor>, settings: EngineSettings) -> Self {
        FlowEngine { executor, settings, flows: RwLock::new(HashMap::new()) }
    }

    /// Replace the registered flow set.
    pub fn register_flows(&self, flows: &[FlowSpec]) {
        let map = flows.iter().map(|f| (f.name.clone(), Arc::new(f.clone()))).collect();
        *self.flows.write() = map;
    }

    pub fn flow_names(&self) -> Vec<String> {
        self.flows.read().keys().cloned().collect()
    }

    // ── Entry points ───────────────────────────────────────────────────

    /// Run a handler's action list (event handler, command, job, rule).
    pub async fn run_actions(
        &self,
        actions: &[Action],
        ctx: &mut ActionContext,
    ) -> Vec<ActionResult> {
        let mut frame = Frame::at_depth(0);
        self.walk(actions, ctx, &mut frame).await
    }

    /// Invoke a named flow with evaluated arguments.
    pub async fn execute_flow(
        &self,
        name: &str,
        args: Map<String, Value>,
        ctx: &ActionContext,
        depth: usize,
    ) -> EngineResult<FlowResult> {
        if depth >= self.settings.max_flow_depth {
            return Err(EngineError::MaxFlowDepth(self.settings.max_flow_depth));
        }
        let flow = self
            .flows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::FlowNotFound(name.to_string()))?;

        let resolved = resolve_args(&flow, args)?;

        let mut child = ctx.clone();
        child.values.insert("args".into(), Value::Object(resolved));
        let mut frame = Frame::at_depth(depth);
        let results = self.walk(&flow.actions, &mut child, &mut frame).await;

        if frame.aborted {
            let reason = frame.abort_reason.clone();
            return Ok(FlowResult {
                success: false,
                value: Value::Null,
                aborted: true,
                error: Some(EngineError::FlowAborted { reason }.to_string()),
            });
        }

        let value = match &flow.returns {
            Some(returns) => {
                let mut scope = self.executor.state.fold_into(&child.values, &child).await?;
                scope.insert(
                    "results".into(),
                    Value::Array(results.iter().map(|r| r.output.clone()).collect()),
                );
                expr::evaluate(returns, &scope)?
            }
            None => frame.return_value.unwrap_or(Value::Null),
        };
        Ok(FlowResult { success: true, value, aborted: false, error: None })
    }

    // ── The walk ───────────────────────────────────────────────────────

    fn walk<'a>(
        &'a self,
        actions: &'a [Action],
        ctx: &'a mut ActionContext,
        frame: &'a mut Frame,
    ) -> BoxFuture<'a, Vec<ActionResult>> {
        async move {
            let mut results = Vec::with_capacity(actions.len());
            for action in actions {
                if ctx.cancel.is_cancelled() || frame.stop() {
                    break;
                }
                results.push(self.run_action(action, ctx, frame).await);
            }
            results
        }
        .boxed()
    }

    /// Execute one action: guard, dispatch, error_handler. Never returns an
    /// Err — failures become failed results.
    fn run_action<'a>(
        &'a self,
        action: &'a Action,
        ctx: &'a mut ActionContext,
        frame: &'a mut Frame,
    ) -> BoxFuture<'a, ActionResult> {
        async move {
            if let Some(when) = &action.when {
                if !self.guard_passes(when, ctx).await {
                    return ActionResult::skipped();
                }
            }

            let outcome = self.dispatch(action, ctx, frame).await;
            match outcome {
                Ok(value) => ActionResult::ok(value),
                Err(e) => {
                    let message = e.to_string();
                    log::warn!("[flow] Action '{}' failed: {message}", action.verb());
                    if !action.error_handler.is_empty() {
                        ctx.set("error", Value::String(message.clone()));
                        ctx.set("errorMessage", Value::String(message.clone()));
                        let mut handler_frame = Frame::at_depth(frame.depth);
                        self.walk(&action.error_handler, ctx, &mut handler_frame).await;
                    }
                    ActionResult::failed(message)
                }
            }
        }
        .boxed()
    }

    /// State-aware guard evaluation; broken guards fail closed.
    pub async fn guard_passes(&self, when: &str, ctx: &ActionContext) -> bool {
        match self.executor.state.evaluate_with_state(when, ctx).await {
            Ok(v) => expr::value::is_truthy(&v),
            Err(e) => {
                log::warn!("[flow] Guard '{when}' failed to evaluate: {e}");
                false
            }
        }
    }

    async fn eval_state(&self, text: &str, ctx: &ActionContext) -> EngineResult<Value> {
        self.executor.state.evaluate_with_state(text, ctx).await
    }

    /// Evaluate a literal-or-expression field with state visible.
    async fn eval_field(&self, v: &Value, ctx: &ActionContext) -> EngineResult<Value> {
        let scope = self.executor.state.fold_into(&ctx.values, ctx).await?;
        match v {
            Value::String(s) => expr::evaluate_field(s, &scope),
            other => expr::interpolate_value(other, &scope),
        }
    }

    async fn dispatch(
        &self,
        action: &Action,
        ctx: &mut ActionContext,
        frame: &mut Frame,
    ) -> EngineResult<Value> {
        match &action.kind {
            ActionKind::Leaf { verb, params } => {
                let interpolated = expr::interpolate_value(&Value::Object(params.clone()), &ctx.values)?;
                let params = interpolated.as_object().cloned().unwrap_or_default();
                self.executor.execute_leaf(verb, &params, ctx).await
            }

            ActionKind::If { cond, then, otherwise } => {
                let branch = if expr::value::is_truthy(&self.eval_state(cond, ctx).await?) {
                    then
                } else {
                    otherwise
                };
                self.walk(branch, ctx, frame).await;
                Ok(Value::Null)
            }

            ActionKind::Switch { value, cases, default } => {
                let selected = self.eval_state(value, ctx).await?;
                let key = expr::value::to_display_string(&selected);
                let branch = cases
                    .iter()
                    .find(|(case, _)| case == &key)
                    .map(|(_, actions)| actions)
                    .unwrap_or(default);
                self.walk(branch, ctx, frame).await;
                Ok(Value::Null)
            }

            ActionKind::While { cond, body, max_iterations } => {
                let cap = max_iterations.unwrap_or(self.settings.max_iterations);
                let mut iterations: u64 = 0;
                while iterations < cap {
                    if ctx.cancel.is_cancelled() || frame.stop() {
                        break;
                    }
                    if !expr::value::is_truthy(&self.eval_state(cond, ctx).await?) {
                        break;
                    }
                    self.walk(body, ctx, frame).await;
                    iterations += 1;
                }
                Ok(Value::from(iterations))
            }

            ActionKind::Repeat { times, body, var } => {
                let evaluated = self.eval_field(times, ctx).await?;
                let n = expr::value::as_number(&evaluated)
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .ok_or_else(|| {
                        EngineError::parameter(format!("'repeat' times must be a non-negative integer, got {evaluated}"))
                    })? as u64;
                let cap = n.min(self.settings.max_iterations);
                for i in 0..cap {
                    if ctx.cancel.is_cancelled() || frame.stop() {
                        break;
                    }
                    ctx.set(var, Value::from(i));
                    self.walk(body, ctx, frame).await;
                }
                Ok(Value::from(cap))
            }

            ActionKind::Parallel { actions } => {
                // Branches run concurrently on cloned contexts; results keep
                // input order. A branch `return`/`abort` stays in its branch.
                let branches = actions.iter().map(|branch| {
                    let mut branch_ctx = ctx.clone();
                    let depth = frame.depth;
                    async move {
                        let mut branch_frame = Frame::at_depth(depth);
                        self.run_action(branch, &mut branch_ctx, &mut branch_frame).await
                    }
                });
                let results = futures::future::join_all(branches).await;
                Ok(Value::Array(results.into_iter().map(|r| r.output).collect()))
            }

            ActionKind::Batch { items, var, concurrency, each } => {
                let evaluated = self.eval_field(items, ctx).await?;
                let list = match evaluated {
                    Value::Array(items) => items,
                    Value::Null => vec![],
                    other => vec![other],
                };
                let index_key = format!("{var}_index");
                if *concurrency <= 1 {
                    for (i, item) in list.iter().enumerate() {
                        if ctx.cancel.is_cancelled() || frame.stop() {
                            break;
                        }
                        ctx.set(var, item.clone());
                        ctx.set(&index_key, Value::from(i));
                        self.walk(each, ctx, frame).await;
                    }
                } else {
                    for (chunk_start, chunk) in
                        list.chunks(*concurrency).enumerate().map(|(n, c)| (n * concurrency, c))
                    {
                        if ctx.cancel.is_cancelled() || frame.stop() {
                            break;
                        }
                        let tasks = chunk.iter().enumerate().map(|(offset, item)| {
                            let mut item_ctx = ctx.clone();
                            item_ctx.set(var, item.clone());
                            item_ctx.set(&index_key, Value::from(chunk_start + offset));
                            let depth = frame.depth;
                            async move {
                                let mut item_frame = Frame::at_depth(depth);
                                self.walk(each, &mut item_ctx, &mut item_frame).await
                            }
                        });
                        futures::future::join_all(tasks).await;
                    }
                }
                Ok(Value::from(list.len()))
            }

            ActionKind::Try { body, catch, finally } => {
                let results = self.walk(body, ctx, frame).await;
                let failure = results.iter().find(|r| !r.success).and_then(|r| r.error.clone());
                if let Some(message) = &failure {
                    if !frame.aborted {
                        ctx.set("error", Value::String(message.clone()));
                        ctx.set("errorMessage", Value::String(message.clone()));
                        self.walk(catch, ctx, frame).await;
                    }
                }
                // `finally` runs no matter how the body ended.
                let was_aborted = std::mem::take(&mut frame.aborted);
                let pending_return = frame.return_value.take();
                self.walk(finally, ctx, frame).await;
                frame.aborted = frame.aborted || was_aborted;
                if frame.return_value.is_none() {
                    frame.return_value = pending_return;
                }
                Ok(Value::Bool(failure.is_none()))
            }

            ActionKind::CallFlow { flow, args, bind } => {
                let mut evaluated = Map::new();
                for (name, raw) in args {
                    evaluated.insert(name.clone(), self.eval_field(raw, ctx).await?);
                }
                let result = self.execute_flow(flow, evaluated, ctx, frame.depth + 1).await?;
                if result.aborted {
                    // Callee abort propagates to the caller's frame.
                    frame.aborted = true;
                    frame.abort_reason = result.error.clone();
                    return Ok(Value::Null);
                }
                if let Some(bind) = bind {
                    ctx.set(bind, result.value.clone());
                }
                Ok(result.value)
            }

            ActionKind::Abort { reason } => {
                frame.aborted = true;
                frame.abort_reason = match reason {
                    Some(r) => Some(expr::interpolate(r, &ctx.values)?),
                    None => None,
                };
                Ok(Value::Null)
            }

            ActionKind::Return { value } => {
                let v = match value {
                    Some(raw) => self.eval_field(raw, ctx).await?,
                    None => Value::Null,
                };
                frame.return_value = Some(v.clone());
                Ok(v)
            }
        }
    }
}

/// Apply declared defaults, reject missing required parameters and type
/// mismatches.
fn resolve_args(flow: &FlowSpec, mut args: Map<String, Value>) -> EngineResult<Map<String, Value>> {
    let mut resolved = Map::new();
    for param in &flow.parameters {
        let value = match args.remove(&param.name) {
            Some(v) if !v.is_null() => v,
            _ => match &param.default {
                Some(d) => d.clone(),
                None if param.required => {
                    return Err(EngineError::parameter(format!(
                        "flow '{}' missing required parameter '{}'",
                        flow.name, param.name
                    )));
                }
                None => Value::Null,
            },
        };
        if !value.is_null() && !param.param_type.accepts(&value) {
            return Err(EngineError::parameter(format!(
                "flow '{}' parameter '{}' expects {}, got {value}",
                flow.name,
                param.name,
                param.param_type.as_str()
            )));
        }
        resolved.insert(param.name.clone(), value);
    }
    // Undeclared arguments pass through untouched.
    for (name, v) in args {
        resolved.insert(name, v);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builders::TemplateRegistry;
    use crate::engine::client::NullClient;
    use crate::engine::spec::parse_spec;
    use crate::engine::state::StateManager;
    use crate::engine::storage::memory::MemoryStorage;
    use crate::engine::timers::TimerManager;
    use crate::engine::voice::{NullVoiceBackend, VoiceManager};
    use serde_json::json;

    fn engine_for(spec_yaml: &str) -> (FlowEngine, Arc<NullClient>) {
        let doc = parse_spec(spec_yaml).unwrap();
        let client = Arc::new(NullClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = Arc::new(Executor {
            client: client.clone(),
            storage: storage.clone(),
            state: Arc::new(StateManager::new(storage, &doc.state)),
            voice: Arc::new(VoiceManager::new(Arc::new(NullVoiceBackend::default()), 100, 100)),
            timers: Arc::new(TimerManager::new(events_tx.clone())),
            templates: Arc::new(TemplateRegistry::from_spec(&doc.components)),
            events_tx,
        });
        let engine = FlowEngine::new(executor, doc.engine.clone());
        engine.register_flows(&doc.flows);
        (engine, client)
    }

    fn actions(yaml: &str) -> Vec<Action> {
        let mut v: Value = serde_yaml::from_str(yaml).unwrap();
        crate::engine::normalize::normalize_actions(&mut v).unwrap();
        Action::list(Some(&v)).unwrap()
    }

    #[tokio::test]
    async fn sequence_continues_past_failures() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- kick: {}            # fails: no guild/user anywhere
- send_message: {channel: c1, content: "still here"}
"#,
        );
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn when_guard_skips() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- send_message: {channel: c1, content: "yes"}
  when: "n > 1"
- send_message: {channel: c1, content: "no"}
  when: "n < 1"
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.set("n", json!(5));
        let results = engine.run_actions(&list, &mut ctx).await;
        assert!(!results[0].skipped);
        assert!(results[1].skipped);
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args["msg"]["content"], json!("yes"));
    }

    #[tokio::test]
    async fn if_branches_and_interpolation() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- flow_if:
    if: "user.id == '12345'"
    then:
      - reply: {channel: c1, content: "Admin access granted"}
    else:
      - reply: {channel: c1, content: "Access denied"}
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.set("user", json!({"id": "12345"}));
        engine.run_actions(&list, &mut ctx).await;
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args["msg"]["content"], json!("Admin access granted"));
    }

    #[tokio::test]
    async fn switch_selects_case_or_default() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- flow_switch:
    value: "${kind}"
    cases:
      greet:
        - send_message: {channel: c1, content: "hello"}
    default:
      - send_message: {channel: c1, content: "unknown"}
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.set("kind", json!("greet"));
        engine.run_actions(&list, &mut ctx.clone()).await;
        ctx.set("kind", json!("other"));
        engine.run_actions(&list, &mut ctx).await;
        let contents: Vec<Value> =
            client.calls_named("send_message").iter().map(|c| c.args["msg"]["content"].clone()).collect();
        assert_eq!(contents, vec![json!("hello"), json!("unknown")]);
    }

    #[tokio::test]
    async fn while_caps_at_engine_limit() {
        let (engine, _) = engine_for("engine: {max_iterations: 25}");
        let list = actions(
            r#"
- flow_while:
    while: "true"
    do:
      - log: {message: spin}
"#,
        );
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert_eq!(results[0].output, json!(25));
    }

    #[tokio::test]
    async fn repeat_exposes_index_and_caps() {
        let (engine, client) = engine_for("engine: {max_iterations: 3}");
        let list = actions(
            r#"
- repeat:
    times: 1000000000
    do:
      - send_message: {channel: c1, content: "i=${i}"}
"#,
        );
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert_eq!(results[0].output, json!(3));
        let contents: Vec<Value> =
            client.calls_named("send_message").iter().map(|c| c.args["msg"]["content"].clone()).collect();
        assert_eq!(contents, vec![json!("i=0"), json!("i=1"), json!("i=2")]);
    }

    #[tokio::test]
    async fn repeat_rejects_bad_times() {
        let (engine, _) = engine_for("{}");
        let list = actions("- repeat: {times: -2, do: [{log: {message: x}}]}");
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert!(!results[0].success);
        let list = actions("- repeat: {times: 2.5, do: [{log: {message: x}}]}");
        let results = engine.run_actions(&list, &mut ActionContext::empty()).await;
        assert!(!results[0].success);
    }

    #[tokio::test]
    async fn abort_short_circuits_rest_of_list() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- send_message: {channel: c1, content: "first"}
- abort: {reason: "stop here"}
- send_message: {channel: c1, content: "never"}
"#,
        );
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert_eq!(results.len(), 2);
        assert_eq!(client.calls_named("send_message").len(), 1);
    }

    #[tokio::test]
    async fn try_catch_finally_order() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- try:
    do:
      - kick: {}      # fails
    catch:
      - send_message: {channel: c1, content: "caught: ${errorMessage}"}
    finally:
      - send_message: {channel: c1, content: "finally"}
"#,
        );
        engine.run_actions(&list, &mut ActionContext::empty()).await;
        let contents: Vec<String> = client
            .calls_named("send_message")
            .iter()
            .map(|c| c.args["msg"]["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents.len(), 2);
        assert!(contents[0].starts_with("caught:"));
        assert_eq!(contents[1], "finally");
    }

    #[tokio::test]
    async fn finally_runs_without_failure_too() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- try:
    do:
      - send_message: {channel: c1, content: "ok"}
    catch:
      - send_message: {channel: c1, content: "not reached"}
    finally:
      - send_message: {channel: c1, content: "finally"}
"#,
        );
        engine.run_actions(&list, &mut ActionContext::empty()).await;
        let contents: Vec<Value> =
            client.calls_named("send_message").iter().map(|c| c.args["msg"]["content"].clone()).collect();
        assert_eq!(contents, vec![json!("ok"), json!("finally")]);
    }

    #[tokio::test]
    async fn parallel_preserves_result_order() {
        let (engine, _) = engine_for("{}");
        let list = actions(
            r#"
- parallel:
    actions:
      - return: {value: "a"}
      - return: {value: "b"}
      - return: {value: "c"}
"#,
        );
        let mut ctx = ActionContext::empty();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert_eq!(results[0].output, json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn batch_iterates_with_index() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- batch:
    items: "${names}"
    as: name
    each:
      - send_message: {channel: c1, content: "${name_index}:${name}"}
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.set("names", json!(["x", "y"]));
        engine.run_actions(&list, &mut ctx).await;
        let contents: Vec<Value> =
            client.calls_named("send_message").iter().map(|c| c.args["msg"]["content"].clone()).collect();
        assert_eq!(contents, vec![json!("0:x"), json!("1:y")]);
    }

    #[tokio::test]
    async fn call_flow_binds_return_value() {
        let (engine, _) = engine_for(
            r#"
flows:
  double:
    parameters:
      - {name: n, type: number, required: true}
    actions:
      - return: {value: "${args.n * 2}"}
"#,
        );
        let list = actions(
            r#"
- call_flow: {flow: double, args: {n: "${seed}"}, as: doubled}
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.set("seed", json!(21));
        engine.run_actions(&list, &mut ctx).await;
        assert_eq!(ctx.get("doubled"), &json!(42));
    }

    #[tokio::test]
    async fn flow_parameter_validation() {
        let (engine, _) = engine_for(
            r#"
flows:
  typed:
    parameters:
      - {name: items, type: array, required: true}
      - {name: label, type: string, default: "unnamed"}
    actions:
      - return: {value: "${args.label}"}
"#,
        );
        let ctx = ActionContext::empty();
        // Missing required.
        let err = engine.execute_flow("typed", Map::new(), &ctx, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
        // Object is not array.
        let mut args = Map::new();
        args.insert("items".into(), json!({"not": "array"}));
        let err = engine.execute_flow("typed", args, &ctx, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
        // Defaults apply.
        let mut args = Map::new();
        args.insert("items".into(), json!([1]));
        let result = engine.execute_flow("typed", args, &ctx, 0).await.unwrap();
        assert_eq!(result.value, json!("unnamed"));
    }

    #[tokio::test]
    async fn unknown_flow_and_depth_cap() {
        let (engine, _) = engine_for(
            r#"
engine: {max_flow_depth: 3}
flows:
  recursive:
    actions:
      - log: {message: tick}
      - call_flow: {flow: recursive}
"#,
        );
        let ctx = ActionContext::empty();
        let err = engine.execute_flow("missing", Map::new(), &ctx, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::FlowNotFound(_)));

        // Unbounded recursion stops at the cap; the outer call still
        // succeeds because the depth error is caught as an action failure.
        let result = engine.execute_flow("recursive", Map::new(), &ctx, 0).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn flow_abort_reaches_caller_result() {
        let (engine, _) = engine_for(
            r#"
flows:
  bail:
    actions:
      - abort: {reason: "nope"}
      - log: {message: never}
"#,
        );
        let ctx = ActionContext::empty();
        let result = engine.execute_flow("bail", Map::new(), &ctx, 0).await.unwrap();
        assert!(!result.success);
        assert!(result.aborted);
        assert!(result.error.as_deref().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn callee_abort_propagates_to_caller() {
        let (engine, client) = engine_for(
            r#"
flows:
  inner:
    actions:
      - abort: {reason: "deep"}
  outer:
    actions:
      - call_flow: {flow: inner}
      - send_message: {channel: c1, content: "unreachable"}
"#,
        );
        let ctx = ActionContext::empty();
        let result = engine.execute_flow("outer", Map::new(), &ctx, 0).await.unwrap();
        assert!(result.aborted);
        assert!(client.calls_named("send_message").is_empty());
    }

    #[tokio::test]
    async fn returns_expression_sees_results() {
        let (engine, _) = engine_for(
            r#"
flows:
  counted:
    returns: "results | length"
    actions:
      - log: {message: one}
      - log: {message: two}
"#,
        );
        let ctx = ActionContext::empty();
        let result = engine.execute_flow("counted", Map::new(), &ctx, 0).await.unwrap();
        assert_eq!(result.value, json!(2));
    }

    #[tokio::test]
    async fn cancellation_stops_between_steps() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- send_message: {channel: c1, content: "one"}
- send_message: {channel: c1, content: "two"}
"#,
        );
        let mut ctx = ActionContext::empty();
        ctx.cancel.cancel();
        let results = engine.run_actions(&list, &mut ctx).await;
        assert!(results.is_empty());
        assert!(client.calls_named("send_message").is_empty());
    }

    #[tokio::test]
    async fn error_handler_runs_on_failure() {
        let (engine, client) = engine_for("{}");
        let list = actions(
            r#"
- kick: {}
  error_handler:
    - send_message: {channel: c1, content: "handled: ${errorMessage}"}
"#,
        );
        engine.run_actions(&list, &mut ActionContext::empty()).await;
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].args["msg"]["content"].as_str().unwrap().starts_with("handled:"));
    }
}
