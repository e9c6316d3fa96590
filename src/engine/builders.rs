// Weft Engine — Component & embed builders
//
// Templates from the spec's `components:` block are resolved by name, or an
// inline definition is used directly. Every string field is interpolated;
// colors, styles, select types, and emoji are mapped to their wire form in
// one lookup each.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::expr;
use crate::engine::spec::ComponentsSpec;
use serde_json::{json, Map, Value};

// ── Wire code lookups ──────────────────────────────────────────────────────

/// Semantic button style → platform integer. Unknown styles fall back to
/// primary.
pub fn button_style(style: &str) -> u8 {
    match style.to_ascii_lowercase().as_str() {
        "primary" => 1,
        "secondary" => 2,
        "success" => 3,
        "danger" => 4,
        "link" => 5,
        _ => 1,
    }
}

/// Select menu kind → component type code. Unknown kinds are string selects.
pub fn select_type(kind: &str) -> u8 {
    match kind.to_ascii_lowercase().as_str() {
        "string_select" => 3,
        "user_select" => 5,
        "role_select" => 6,
        "mentionable_select" => 7,
        "channel_select" => 8,
        _ => 3,
    }
}

/// Text input style → integer code.
pub fn text_input_style(style: &str) -> u8 {
    match style.to_ascii_lowercase().as_str() {
        "paragraph" => 2,
        _ => 1,
    }
}

/// Named standard colors, case-insensitive.
fn named_color(name: &str) -> Option<u32> {
    Some(match name.to_ascii_lowercase().as_str() {
        "default" | "black" => 0x000000,
        "white" => 0xFFFFFF,
        "red" => 0xED4245,
        "green" => 0x57F287,
        "blue" => 0x3498DB,
        "blurple" => 0x5865F2,
        "gold" | "yellow" => 0xFEE75C,
        "orange" => 0xE67E22,
        "purple" => 0x9B59B6,
        "pink" | "fuchsia" => 0xEB459E,
        "teal" => 0x1ABC9C,
        "grey" | "gray" => 0x95A5A6,
        "dark" => 0x2C2F33,
        _ => return None,
    })
}

fn parse_hex(s: &str) -> Option<u32> {
    let hex = s.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Resolve a color definition through the ordered rules:
/// integer literal → `{r,g,b}` → `#RRGGBB` → named color → interpolated
/// expression yielding `#RRGGBB` → 0x000000.
pub fn resolve_color(v: &Value, ctx: &Map<String, Value>) -> u32 {
    match v {
        Value::Number(n) => n.as_u64().map(|i| i as u32).unwrap_or(0),
        Value::Object(map) => {
            let channel = |k: &str| {
                map.get(k).and_then(Value::as_u64).unwrap_or(0).min(255) as u32
            };
            (channel("r") << 16) | (channel("g") << 8) | channel("b")
        }
        Value::String(s) => {
            if let Some(rgb) = parse_hex(s) {
                return rgb;
            }
            if let Some(rgb) = named_color(s) {
                return rgb;
            }
            if s.contains("${") {
                if let Ok(resolved) = expr::interpolate(s, ctx) {
                    if let Some(rgb) = parse_hex(&resolved).or_else(|| named_color(&resolved)) {
                        return rgb;
                    }
                }
            }
            0x000000
        }
        _ => 0x000000,
    }
}

/// Parse an emoji string: `<a?:name:id>` custom form, or a unicode literal.
pub fn parse_emoji(s: &str) -> Value {
    let trimmed = s.trim();
    if let Some(inner) = trimmed.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        let (animated, rest) = match inner.strip_prefix("a:") {
            Some(rest) => (true, rest),
            None => (false, inner.strip_prefix(':').unwrap_or(inner)),
        };
        if let Some((name, id)) = rest.split_once(':') {
            return json!({"name": name, "id": id, "animated": animated});
        }
    }
    json!({ "name": trimmed })
}

// ── Template registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Button,
    Select,
    Modal,
    Embed,
}

/// Holds the spec's component templates; write-once at load.
#[derive(Default)]
pub struct TemplateRegistry {
    buttons: Map<String, Value>,
    selects: Map<String, Value>,
    modals: Map<String, Value>,
    embeds: Map<String, Value>,
}

impl TemplateRegistry {
    pub fn from_spec(components: &ComponentsSpec) -> Self {
        TemplateRegistry {
            buttons: components.buttons.clone(),
            selects: components.selects.clone(),
            modals: components.modals.clone(),
            embeds: components.embeds.clone(),
        }
    }

    pub fn get(&self, kind: TemplateKind, name: &str) -> Option<&Value> {
        match kind {
            TemplateKind::Button => self.buttons.get(name),
            TemplateKind::Select => self.selects.get(name),
            TemplateKind::Modal => self.modals.get(name),
            TemplateKind::Embed => self.embeds.get(name),
        }
    }

    /// Template names with their action lists, for interaction registration.
    pub fn entries(&self, kind: TemplateKind) -> impl Iterator<Item = (&String, &Value)> {
        match kind {
            TemplateKind::Button => self.buttons.iter(),
            TemplateKind::Select => self.selects.iter(),
            TemplateKind::Modal => self.modals.iter(),
            TemplateKind::Embed => self.embeds.iter(),
        }
    }

    /// Accept either a template name or an inline definition.
    fn resolve(&self, kind: TemplateKind, def: &Value) -> EngineResult<Value> {
        match def {
            Value::String(name) => self
                .get(kind, name)
                .cloned()
                .ok_or_else(|| EngineError::normalization(format!("unknown template '{name}'"))),
            Value::Object(_) => Ok(def.clone()),
            other => Err(EngineError::normalization(format!("bad component definition: {other}"))),
        }
    }
}

// ── Builders ───────────────────────────────────────────────────────────────

fn interp(v: &Value, ctx: &Map<String, Value>) -> Value {
    expr::interpolate_value(v, ctx).unwrap_or_else(|_| v.clone())
}

/// Build a wire-form embed from a template name or inline definition.
pub fn build_embed(
    templates: &TemplateRegistry,
    def: &Value,
    ctx: &Map<String, Value>,
) -> EngineResult<Value> {
    let resolved = templates.resolve(TemplateKind::Embed, def)?;
    let mut out = interp(&resolved, ctx);
    if let Some(obj) = out.as_object_mut() {
        let color_src = obj.get("color").cloned().unwrap_or(Value::Null);
        if !color_src.is_null() {
            obj.insert("color".into(), Value::from(resolve_color(&color_src, ctx)));
        }
    }
    Ok(out)
}

/// Build a wire-form button component (type 2).
pub fn build_button(
    templates: &TemplateRegistry,
    def: &Value,
    ctx: &Map<String, Value>,
) -> EngineResult<Value> {
    let resolved = templates.resolve(TemplateKind::Button, def)?;
    let t = interp(&resolved, ctx);
    let mut out = Map::new();
    out.insert("type".into(), json!(2));
    let style = t.get("style").and_then(Value::as_str).unwrap_or("primary");
    out.insert("style".into(), json!(button_style(style)));
    if let Some(label) = t.get("label") {
        out.insert("label".into(), label.clone());
    }
    if style.eq_ignore_ascii_case("link") {
        if let Some(url) = t.get("url") {
            out.insert("url".into(), url.clone());
        }
    } else {
        let custom_id = t
            .get("custom_id")
            .or_else(|| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        out.insert("custom_id".into(), json!(custom_id));
    }
    if let Some(emoji) = t.get("emoji").and_then(Value::as_str) {
        out.insert("emoji".into(), parse_emoji(emoji));
    }
    if let Some(disabled) = t.get("disabled") {
        out.insert("disabled".into(), disabled.clone());
    }
    Ok(Value::Object(out))
}

/// Build a wire-form select menu.
pub fn build_select(
    templates: &TemplateRegistry,
    def: &Value,
    ctx: &Map<String, Value>,
) -> EngineResult<Value> {
    let resolved = templates.resolve(TemplateKind::Select, def)?;
    let t = interp(&resolved, ctx);
    let kind = t.get("type").and_then(Value::as_str).unwrap_or("string_select");
    let mut out = Map::new();
    out.insert("type".into(), json!(select_type(kind)));
    out.insert(
        "custom_id".into(),
        t.get("custom_id").or_else(|| t.get("id")).cloned().unwrap_or(json!("")),
    );
    for key in ["placeholder", "min_values", "max_values", "disabled"] {
        if let Some(v) = t.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if select_type(kind) == 3 {
        let options = t
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .map(|opt| {
                        let mut o = opt.clone();
                        if let Some(map) = o.as_object_mut() {
                            if let Some(emoji) = map.get("emoji").and_then(Value::as_str) {
                                let parsed = parse_emoji(emoji);
                                map.insert("emoji".into(), parsed);
                            }
                        }
                        o
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        out.insert("options".into(), Value::Array(options));
    }
    Ok(Value::Object(out))
}

/// Wrap components into an action row (type 1).
pub fn action_row(components: Vec<Value>) -> Value {
    json!({"type": 1, "components": components})
}

/// Build a wire-form modal: custom_id, title, and each child text input
/// wrapped in its own action-row envelope.
pub fn build_modal(
    templates: &TemplateRegistry,
    def: &Value,
    ctx: &Map<String, Value>,
) -> EngineResult<Value> {
    let resolved = templates.resolve(TemplateKind::Modal, def)?;
    let t = interp(&resolved, ctx);
    let mut rows = Vec::new();
    for input in t.get("components").or_else(|| t.get("inputs")).and_then(Value::as_array).into_iter().flatten() {
        let mut field = Map::new();
        field.insert("type".into(), json!(4));
        field.insert(
            "custom_id".into(),
            input.get("custom_id").or_else(|| input.get("id")).cloned().unwrap_or(json!("")),
        );
        field.insert("label".into(), input.get("label").cloned().unwrap_or(json!("")));
        let style = input.get("style").and_then(Value::as_str).unwrap_or("short");
        field.insert("style".into(), json!(text_input_style(style)));
        for key in ["placeholder", "value", "required", "min_length", "max_length"] {
            if let Some(v) = input.get(key) {
                field.insert(key.into(), v.clone());
            }
        }
        rows.push(action_row(vec![Value::Object(field)]));
    }
    Ok(json!({
        "custom_id": t.get("custom_id").or_else(|| t.get("id")).cloned().unwrap_or(json!("")),
        "title": t.get("title").cloned().unwrap_or(json!("")),
        "components": rows,
    }))
}
