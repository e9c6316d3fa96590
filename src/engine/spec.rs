// Weft Engine — Spec document model
//
// The typed form of the declarative document. The loader parses YAML (or
// JSON), runs the normalizer over the raw tree, then deserializes into these
// structs. Actions come out of normalization in canonical `{action: verb,…}`
// form and are parsed once into a tagged tree: structured variants for the
// flow-control verbs, a `Leaf { verb, params }` variant for everything the
// executor dispatches.
//
// The document is immutable after load; registries hand out Arc'd clones.

use crate::atoms::constants::{
    DEFAULT_MAX_FLOW_DEPTH, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_QUEUE_SIZE,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::normalize;
use crate::engine::storage::{ColumnDef, ColumnType, TableDefinition};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ── Actions ────────────────────────────────────────────────────────────────

/// One unit of work: a verb plus parameters, with the two reserved
/// cross-cutting fields every action may carry.
#[derive(Debug, Clone)]
pub struct Action {
    /// Guard expression; a falsy result skips the action.
    pub when: Option<String>,
    /// Fallback actions run if the handler fails.
    pub error_handler: Vec<Action>,
    pub kind: ActionKind,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    If {
        cond: String,
        then: Vec<Action>,
        otherwise: Vec<Action>,
    },
    Switch {
        value: String,
        cases: Vec<(String, Vec<Action>)>,
        default: Vec<Action>,
    },
    While {
        cond: String,
        body: Vec<Action>,
        max_iterations: Option<u64>,
    },
    Repeat {
        times: Value,
        body: Vec<Action>,
        var: String,
    },
    Parallel {
        actions: Vec<Action>,
    },
    Batch {
        items: Value,
        var: String,
        concurrency: usize,
        each: Vec<Action>,
    },
    Try {
        body: Vec<Action>,
        catch: Vec<Action>,
        finally: Vec<Action>,
    },
    CallFlow {
        flow: String,
        args: Map<String, Value>,
        bind: Option<String>,
    },
    Abort {
        reason: Option<String>,
    },
    Return {
        value: Option<Value>,
    },
    /// Executor-dispatched verb with its parameter bag. Verbs nobody handles
    /// fail at execute time with a normalization error.
    Leaf {
        verb: String,
        params: Map<String, Value>,
    },
}

impl Action {
    /// The verb tag, for logging and dispatch.
    pub fn verb(&self) -> &str {
        match &self.kind {
            ActionKind::If { .. } => "flow_if",
            ActionKind::Switch { .. } => "flow_switch",
            ActionKind::While { .. } => "flow_while",
            ActionKind::Repeat { .. } => "repeat",
            ActionKind::Parallel { .. } => "parallel",
            ActionKind::Batch { .. } => "batch",
            ActionKind::Try { .. } => "try",
            ActionKind::CallFlow { .. } => "call_flow",
            ActionKind::Abort { .. } => "abort",
            ActionKind::Return { .. } => "return",
            ActionKind::Leaf { verb, .. } => verb,
        }
    }

    /// Parse a canonical (already normalized) action value.
    pub fn from_value(v: &Value) -> EngineResult<Action> {
        let obj = v
            .as_object()
            .ok_or_else(|| EngineError::normalization(format!("action must be a mapping: {v}")))?;
        let verb = obj
            .get("action")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::normalization("action record has no verb"))?;

        let when = obj.get("when").and_then(Value::as_str).map(str::to_string);
        let error_handler = Self::list(obj.get("error_handler"))?;

        let str_field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let required_str = |key: &str| {
            str_field(key).ok_or_else(|| {
                EngineError::normalization(format!("'{verb}' requires a '{key}' field"))
            })
        };

        let kind = match verb {
            "flow_if" => ActionKind::If {
                cond: required_str("if")?,
                then: Self::list(obj.get("then"))?,
                otherwise: Self::list(obj.get("else"))?,
            },
            "flow_switch" => {
                let cases = obj
                    .get("cases")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .map(|(k, branch)| Ok((k.clone(), Self::list(Some(branch))?)))
                            .collect::<EngineResult<Vec<_>>>()
                    })
                    .transpose()?
                    .unwrap_or_default();
                ActionKind::Switch {
                    value: required_str("value")?,
                    cases,
                    default: Self::list(obj.get("default"))?,
                }
            }
            "flow_while" => ActionKind::While {
                cond: required_str("while")?,
                body: Self::list(obj.get("do"))?,
                max_iterations: obj.get("max_iterations").and_then(Value::as_u64),
            },
            "repeat" => ActionKind::Repeat {
                times: obj.get("times").cloned().unwrap_or(Value::Null),
                body: Self::list(obj.get("do"))?,
                var: str_field("as").unwrap_or_else(|| "i".to_string()),
            },
            "parallel" => ActionKind::Parallel { actions: Self::list(obj.get("actions"))? },
            "batch" => ActionKind::Batch {
                items: obj.get("items").cloned().unwrap_or(Value::Null),
                var: str_field("as").unwrap_or_else(|| "item".to_string()),
                concurrency: obj.get("concurrency").and_then(Value::as_u64).unwrap_or(1).max(1)
                    as usize,
                each: Self::list(obj.get("each"))?,
            },
            "try" => ActionKind::Try {
                body: Self::list(obj.get("do"))?,
                catch: Self::list(obj.get("catch"))?,
                finally: Self::list(obj.get("finally"))?,
            },
            "call_flow" => ActionKind::CallFlow {
                flow: required_str("flow")?,
                args: obj.get("args").and_then(Value::as_object).cloned().unwrap_or_default(),
                bind: str_field("as"),
            },
            "abort" => ActionKind::Abort { reason: str_field("reason") },
            "return" => ActionKind::Return { value: obj.get("value").cloned() },
            leaf => {
                let mut params = Map::new();
                for (k, pv) in obj {
                    if k != "action" && k != "when" && k != "error_handler" {
                        params.insert(k.clone(), pv.clone());
                    }
                }
                ActionKind::Leaf { verb: leaf.to_string(), params }
            }
        };

        Ok(Action { when, error_handler, kind })
    }

    /// Parse an action-list slot. Absent slots are empty lists.
    pub fn list(v: Option<&Value>) -> EngineResult<Vec<Action>> {
        match v {
            None | Some(Value::Null) => Ok(vec![]),
            Some(Value::Array(items)) => items.iter().map(Action::from_value).collect(),
            Some(other) => {
                Err(EngineError::normalization(format!("expected an action list, found {other}")))
            }
        }
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Action::from_value(&v).map_err(serde::de::Error::custom)
    }
}

// ── Collections helpers ────────────────────────────────────────────────────

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(t) => vec![t],
        OneOrMany::Many(v) => v,
    })
}

fn default_true() -> bool {
    true
}

// ── Document ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpecDocument {
    pub identity: Identity,
    pub presence: Option<Presence>,
    pub intents: IntentsSpec,
    pub commands: Vec<CommandSpec>,
    pub context_menus: Vec<ContextMenuSpec>,
    pub events: Vec<EventHandlerSpec>,
    pub flows: Vec<FlowSpec>,
    pub scheduler: SchedulerSpec,
    pub automod: AutomodSpec,
    pub components: ComponentsSpec,
    pub state: StateSpec,
    pub voice: Option<VoiceSpec>,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Presence {
    pub status: String,
    pub activity: Option<ActivitySpec>,
}

impl Default for Presence {
    fn default() -> Self {
        Presence { status: "online".into(), activity: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySpec {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    pub name: String,
}

/// `intents: auto` or an explicit list of intent names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntentsSpec {
    Mode(String),
    Explicit(Vec<String>),
}

impl Default for IntentsSpec {
    fn default() -> Self {
        IntentsSpec::Mode("auto".into())
    }
}

impl IntentsSpec {
    pub fn is_auto(&self) -> bool {
        matches!(self, IntentsSpec::Mode(m) if m == "auto")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
    #[serde(default)]
    pub subcommands: Vec<CommandSpec>,
    #[serde(default)]
    pub ephemeral: bool,
    /// Restrict registration to one guild; global when absent.
    #[serde(default)]
    pub guild: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(rename = "type", default = "default_option_type")]
    pub option_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub choices: Vec<Value>,
}

fn default_option_type() -> String {
    "string".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextMenuSpec {
    pub name: String,
    /// `user` or `message`.
    #[serde(rename = "type", default = "default_menu_type")]
    pub menu_type: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_menu_type() -> String {
    "user".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventHandlerSpec {
    pub event: String,
    #[serde(default)]
    pub when: Option<String>,
    /// Suppress re-fires within this window (milliseconds).
    #[serde(default)]
    pub debounce: Option<u64>,
    /// At most one fire per window (milliseconds).
    #[serde(default)]
    pub throttle: Option<u64>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<FlowParam>,
    /// Expression evaluated after the walk; its value is the flow's result.
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParamType {
    /// Type check a resolved argument. `array` is recognized separately from
    /// `object`.
    pub fn accepts(&self, v: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::String => v.is_string(),
            ParamType::Number => v.is_number(),
            ParamType::Boolean => v.is_boolean(),
            ParamType::Array => v.is_array(),
            ParamType::Object => v.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerSpec {
    pub timezone: Option<String>,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Five fields: minute hour day-of-month month day-of-week.
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutomodSpec {
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(alias = "triggers", deserialize_with = "one_or_many")]
    pub trigger: Vec<TriggerSpec>,
    #[serde(default)]
    pub exempt: ExemptSpec,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub escalation: Option<EscalationSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExemptSpec {
    pub users: Vec<String>,
    pub roles: Vec<String>,
    pub channels: Vec<String>,
    pub permissions: Vec<String>,
}

impl ExemptSpec {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.roles.is_empty()
            && self.channels.is_empty()
            && self.permissions.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationSpec {
    /// Rule matches within `window` before the escalation actions fire.
    pub threshold: u64,
    /// Milliseconds.
    pub window: u64,
    pub actions: Vec<Action>,
}

impl Default for EscalationSpec {
    fn default() -> Self {
        EscalationSpec { threshold: 3, window: 300_000, actions: vec![] }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Keyword {
        keywords: Vec<String>,
        #[serde(default)]
        allowed: Vec<String>,
    },
    Regex {
        #[serde(deserialize_with = "one_or_many")]
        regex: Vec<String>,
    },
    Link {
        #[serde(default)]
        blocked: Vec<String>,
        #[serde(default)]
        allowed: Vec<String>,
    },
    Invite,
    Caps {
        #[serde(default)]
        threshold: Option<f64>,
    },
    EmojiSpam {
        #[serde(default)]
        threshold: Option<usize>,
    },
    MentionSpam {
        #[serde(default)]
        threshold: Option<usize>,
    },
    NewlineSpam {
        #[serde(default)]
        threshold: Option<usize>,
    },
    Attachment {
        #[serde(default)]
        blocked: Vec<String>,
        #[serde(default)]
        allowed: Vec<String>,
        #[serde(default)]
        threshold: Option<usize>,
    },
    Spam {
        #[serde(default = "default_spam_threshold")]
        threshold: usize,
        /// Milliseconds.
        #[serde(default = "default_spam_window")]
        window: u64,
    },
    Duplicate {
        #[serde(default = "default_spam_threshold")]
        threshold: usize,
        /// Milliseconds.
        #[serde(default)]
        window: Option<u64>,
    },
}

fn default_spam_threshold() -> usize {
    5
}

fn default_spam_window() -> u64 {
    5_000
}

impl TriggerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Keyword { .. } => "keyword",
            TriggerSpec::Regex { .. } => "regex",
            TriggerSpec::Link { .. } => "link",
            TriggerSpec::Invite => "invite",
            TriggerSpec::Caps { .. } => "caps",
            TriggerSpec::EmojiSpam { .. } => "emoji_spam",
            TriggerSpec::MentionSpam { .. } => "mention_spam",
            TriggerSpec::NewlineSpam { .. } => "newline_spam",
            TriggerSpec::Attachment { .. } => "attachment",
            TriggerSpec::Spam { .. } => "spam",
            TriggerSpec::Duplicate { .. } => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComponentsSpec {
    pub buttons: Map<String, Value>,
    pub selects: Map<String, Value>,
    pub modals: Map<String, Value>,
    pub embeds: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateSpec {
    pub variables: Map<String, Value>,
    pub tables: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VariableSpec {
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub scope: VariableScope,
    pub default: Value,
}

impl Default for VariableSpec {
    fn default() -> Self {
        VariableSpec { value_type: None, scope: VariableScope::Global, default: Value::Null }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    #[default]
    Global,
    Guild,
    Channel,
    User,
    Member,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub primary: bool,
    pub unique: bool,
    pub index: bool,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        ColumnSpec { column_type: ColumnType::String, primary: false, unique: false, index: false }
    }
}

impl StateSpec {
    /// Typed view of a declared variable.
    pub fn variable(&self, name: &str) -> Option<VariableSpec> {
        self.variables
            .get(name)
            .and_then(|v| serde_json::from_value::<VariableSpec>(v.clone()).ok())
    }

    /// Convert the declared tables into storage definitions, in declaration
    /// order.
    pub fn table_definitions(&self) -> EngineResult<Vec<TableDefinition>> {
        let mut defs = Vec::with_capacity(self.tables.len());
        for (name, raw) in &self.tables {
            let obj = raw.as_object().ok_or_else(|| {
                EngineError::normalization(format!("table '{name}' must be a mapping"))
            })?;
            let columns_raw = obj.get("columns").and_then(Value::as_object).ok_or_else(|| {
                EngineError::normalization(format!("table '{name}' declares no columns"))
            })?;
            let mut columns = Vec::with_capacity(columns_raw.len());
            for (col_name, col_raw) in columns_raw {
                let spec: ColumnSpec =
                    serde_json::from_value(col_raw.clone()).map_err(|e| {
                        EngineError::normalization(format!("column '{name}.{col_name}': {e}"))
                    })?;
                columns.push(ColumnDef {
                    name: col_name.clone(),
                    column_type: spec.column_type,
                    primary: spec.primary,
                    unique: spec.unique,
                    index: spec.index,
                });
            }
            let indexes: Vec<Vec<String>> = obj
                .get("indexes")
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| EngineError::normalization(format!("table '{name}' indexes: {e}")))?
                .unwrap_or_default();
            let def = TableDefinition { name: name.clone(), columns, indexes };
            def.validate()?;
            defs.push(def);
        }
        Ok(defs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceSpec {
    pub max_queue_size: usize,
    pub default_volume: u32,
}

impl Default for VoiceSpec {
    fn default() -> Self {
        VoiceSpec { max_queue_size: DEFAULT_MAX_QUEUE_SIZE, default_volume: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_flow_depth: usize,
    pub max_iterations: u64,
    pub scheduler_timezone: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_flow_depth: DEFAULT_MAX_FLOW_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            scheduler_timezone: "UTC".into(),
        }
    }
}

// ── Loader ─────────────────────────────────────────────────────────────────

/// Parse a spec document from YAML (or JSON), normalize it, and build the
/// typed model.
pub fn parse_spec(text: &str) -> EngineResult<SpecDocument> {
    let mut tree: Value = if text.trim_start().starts_with('{') {
        serde_json::from_str(text)?
    } else {
        serde_yaml::from_str(text)?
    };
    normalize::normalize_document(&mut tree)?;
    serde_json::from_value(tree).map_err(|e| EngineError::normalization(e.to_string()))
}

/// Load and parse a spec document from disk.
pub fn load_spec(path: &std::path::Path) -> EngineResult<SpecDocument> {
    let text = std::fs::read_to_string(path)?;
    parse_spec(&text)
}
