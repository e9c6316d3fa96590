// Weft Engine — Spec Normalizer
//
// Canonicalizes the loaded document tree before the typed model is built:
//
//   • Shorthand actions `{reply: {content: hi}}` become `{action: reply,
//     content: hi}`. The first key that is not `when`/`error_handler` names
//     the verb; a mapping value merges as parameters, anything else is
//     discarded.
//   • Collections given as name-keyed mappings become ordered sequences,
//     each element carrying its former key as `name` (or `event` for event
//     handlers).
//   • Every nested action slot of the flow-control verbs is rewritten
//     recursively, as are the action lists of commands, subcommands,
//     context menus, event handlers, flows, jobs, rules, escalations, and
//     component templates.
//
// Runs once at load and is idempotent: normalizing a normalized tree is a
// no-op.

use crate::atoms::error::{EngineError, EngineResult};
use serde_json::{Map, Value};

/// Fields that never name a verb on an action record.
const RESERVED: &[&str] = &["action", "when", "error_handler"];

/// Nested action-list slots per flow-control verb.
fn nested_slots(verb: &str) -> &'static [&'static str] {
    match verb {
        "flow_if" => &["then", "else"],
        "flow_while" => &["do"],
        "repeat" => &["do"],
        "parallel" => &["actions"],
        "batch" => &["each"],
        "try" => &["do", "catch", "finally"],
        _ => &[],
    }
}

/// Normalize a whole spec document in place.
pub fn normalize_document(doc: &mut Value) -> EngineResult<()> {
    let Some(root) = doc.as_object_mut() else {
        return Err(EngineError::normalization("spec document must be a mapping"));
    };

    for key in ["commands", "context_menus", "flows"] {
        if let Some(v) = root.get_mut(key) {
            seq_or_map(v, "name")?;
            for record in v.as_array_mut().into_iter().flatten() {
                normalize_record(record)?;
            }
        }
    }

    if let Some(v) = root.get_mut("events") {
        seq_or_map(v, "event")?;
        for record in v.as_array_mut().into_iter().flatten() {
            normalize_record(record)?;
        }
    }

    if let Some(scheduler) = root.get_mut("scheduler").and_then(Value::as_object_mut) {
        if let Some(jobs) = scheduler.get_mut("jobs") {
            seq_or_map(jobs, "name")?;
            for record in jobs.as_array_mut().into_iter().flatten() {
                normalize_record(record)?;
            }
        }
    }

    if let Some(automod) = root.get_mut("automod").and_then(Value::as_object_mut) {
        if let Some(rules) = automod.get_mut("rules") {
            seq_or_map(rules, "name")?;
            for record in rules.as_array_mut().into_iter().flatten() {
                normalize_record(record)?;
                if let Some(esc) = record.get_mut("escalation") {
                    normalize_record(esc)?;
                }
            }
        }
    }

    if let Some(components) = root.get_mut("components").and_then(Value::as_object_mut) {
        for kind in ["buttons", "selects", "modals"] {
            let templates = components.get_mut(kind).and_then(Value::as_object_mut);
            for (_, template) in templates.into_iter().flatten() {
                normalize_record(template)?;
            }
        }
    }

    Ok(())
}

/// Rewrite a mapping-form collection into a sequence whose elements carry
/// their former key under `key_field`. Sequences pass through. A mapping
/// entry whose value is itself a sequence is treated as a bare action list.
fn seq_or_map(v: &mut Value, key_field: &str) -> EngineResult<()> {
    let map = match v {
        Value::Array(_) => return Ok(()),
        Value::Object(map) => std::mem::take(map),
        Value::Null => {
            *v = Value::Array(vec![]);
            return Ok(());
        }
        other => {
            return Err(EngineError::normalization(format!(
                "expected a sequence or mapping, found {other}"
            )));
        }
    };

    let mut seq = Vec::with_capacity(map.len());
    for (name, entry) in map {
        let record = match entry {
            Value::Object(mut fields) => {
                fields.entry(key_field.to_string()).or_insert_with(|| Value::String(name));
                Value::Object(fields)
            }
            Value::Array(actions) => {
                let mut fields = Map::new();
                fields.insert(key_field.to_string(), Value::String(name));
                fields.insert("actions".to_string(), Value::Array(actions));
                Value::Object(fields)
            }
            other => {
                return Err(EngineError::normalization(format!(
                    "collection entry '{name}' must be a mapping or action list, found {other}"
                )));
            }
        };
        seq.push(record);
    }
    *v = Value::Array(seq);
    Ok(())
}

/// Normalize the `actions` list of a record, plus any nested subcommands
/// and flow parameter collections.
fn normalize_record(record: &mut Value) -> EngineResult<()> {
    let Some(fields) = record.as_object_mut() else { return Ok(()) };
    if let Some(actions) = fields.get_mut("actions") {
        normalize_actions(actions)?;
    }
    if let Some(subs) = fields.get_mut("subcommands") {
        seq_or_map(subs, "name")?;
        for sub in subs.as_array_mut().into_iter().flatten() {
            normalize_record(sub)?;
        }
    }
    if let Some(params) = fields.get_mut("parameters") {
        seq_or_map(params, "name")?;
    }
    Ok(())
}

/// Normalize an action list. A single mapping is wrapped into a one-element
/// list; null becomes an empty list.
pub fn normalize_actions(v: &mut Value) -> EngineResult<()> {
    match v {
        Value::Null => {
            *v = Value::Array(vec![]);
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                normalize_action(item)?;
            }
            Ok(())
        }
        Value::Object(_) => {
            let single = std::mem::replace(v, Value::Null);
            *v = Value::Array(vec![single]);
            if let Some(item) = v.as_array_mut().and_then(|a| a.get_mut(0)) {
                normalize_action(item)?;
            }
            Ok(())
        }
        other => Err(EngineError::normalization(format!("expected an action list, found {other}"))),
    }
}

/// Normalize one action into the canonical `{action: verb, …}` form and
/// recurse through its nested slots.
pub fn normalize_action(v: &mut Value) -> EngineResult<()> {
    let Some(fields) = v.as_object_mut() else {
        return Err(EngineError::normalization(format!("action must be a mapping, found {v}")));
    };

    if !fields.get("action").map(Value::is_string).unwrap_or(false) {
        // Shorthand form: the first non-reserved key names the verb.
        let verb_key = fields
            .keys()
            .find(|k| !RESERVED.contains(&k.as_str()))
            .cloned()
            .ok_or_else(|| EngineError::normalization("action record has no verb"))?;
        let body = fields.remove(&verb_key).unwrap_or(Value::Null);

        let mut canonical = Map::new();
        canonical.insert("action".to_string(), Value::String(verb_key));
        if let Value::Object(params) = body {
            for (k, pv) in params {
                canonical.insert(k, pv);
            }
        }
        // Non-mapping bodies carry no parameters.
        for reserved in ["when", "error_handler"] {
            if let Some(rv) = fields.remove(reserved) {
                canonical.insert(reserved.to_string(), rv);
            }
        }
        *fields = canonical;
    }

    let verb = fields
        .get("action")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::normalization("action record has no verb"))?;

    if let Some(handler) = fields.get_mut("error_handler") {
        normalize_actions(handler)?;
    }

    for slot in nested_slots(&verb) {
        if let Some(nested) = fields.get_mut(*slot) {
            normalize_actions(nested)?;
        }
    }

    if verb == "flow_switch" {
        if let Some(cases) = fields.get_mut("cases").and_then(Value::as_object_mut) {
            for (_, branch) in cases {
                normalize_actions(branch)?;
            }
        }
        if let Some(default) = fields.get_mut("default") {
            normalize_actions(default)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shorthand_folds_into_canonical_form() {
        let mut v = json!({"reply": {"content": "hi"}});
        normalize_action(&mut v).unwrap();
        assert_eq!(v, json!({"action": "reply", "content": "hi"}));
    }

    #[test]
    fn shorthand_discards_non_mapping_body() {
        let mut v = json!({"defer": true});
        normalize_action(&mut v).unwrap();
        assert_eq!(v, json!({"action": "defer"}));
    }

    #[test]
    fn reserved_fields_are_carried_over() {
        let mut v = json!({"reply": {"content": "x"}, "when": "user.id == '1'"});
        normalize_action(&mut v).unwrap();
        assert_eq!(v, json!({"action": "reply", "content": "x", "when": "user.id == '1'"}));
    }

    #[test]
    fn canonical_actions_pass_through() {
        let mut v = json!({"action": "kick", "user": "${user.id}"});
        let before = v.clone();
        normalize_action(&mut v).unwrap();
        assert_eq!(v, before);
    }

    #[test]
    fn nested_slots_recurse() {
        let mut v = json!({
            "flow_if": {
                "if": "x > 1",
                "then": [{"reply": {"content": "big"}}],
                "else": [{"log": {"message": "small"}}],
            }
        });
        normalize_action(&mut v).unwrap();
        assert_eq!(
            v,
            json!({
                "action": "flow_if",
                "if": "x > 1",
                "then": [{"action": "reply", "content": "big"}],
                "else": [{"action": "log", "message": "small"}],
            })
        );
    }

    #[test]
    fn switch_cases_recurse() {
        let mut v = json!({
            "flow_switch": {
                "value": "${kind}",
                "cases": {"a": [{"log": {"message": "a"}}]},
                "default": [{"log": {"message": "d"}}],
            }
        });
        normalize_action(&mut v).unwrap();
        assert_eq!(v["cases"]["a"][0], json!({"action": "log", "message": "a"}));
        assert_eq!(v["default"][0], json!({"action": "log", "message": "d"}));
    }

    #[test]
    fn error_handler_lists_normalize() {
        let mut v = json!({
            "action": "db_insert",
            "table": "warns",
            "error_handler": {"log": {"message": "insert failed"}},
        });
        normalize_action(&mut v).unwrap();
        assert_eq!(v["error_handler"], json!([{"action": "log", "message": "insert failed"}]));
    }

    #[test]
    fn mapping_collections_become_sequences() {
        let mut doc = json!({
            "events": {
                "message_create": {"actions": [{"log": {"message": "m"}}]},
                "ready": [{"log": {"message": "up"}}],
            },
            "flows": {
                "greet": {"actions": [{"reply": {"content": "hello"}}]},
            },
        });
        normalize_document(&mut doc).unwrap();
        let events = doc["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], json!("message_create"));
        // Bare action-list entries become {event, actions}.
        assert_eq!(events[1]["event"], json!("ready"));
        assert_eq!(events[1]["actions"][0]["action"], json!("log"));
        assert_eq!(doc["flows"][0]["name"], json!("greet"));
    }

    #[test]
    fn missing_verb_is_an_error() {
        let mut v = json!({"when": "true"});
        assert!(normalize_action(&mut v).is_err());
        let mut v = json!("just a string");
        assert!(normalize_action(&mut v).is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut doc = json!({
            "commands": {
                "echo": {
                    "description": "say it back",
                    "options": [{"name": "text", "type": "string", "required": true}],
                    "actions": [{"reply": {"content": "You said: ${args.text}"}}],
                }
            },
            "events": {"member_join": [{"send_message": {"content": "welcome"}}]},
            "scheduler": {"jobs": {"tick": {"cron": "* * * * *", "actions": [{"log": {"message": "t"}}]}}},
            "automod": {"rules": {"caps": {"trigger": {"type": "caps"}, "actions": [{"delete_message": {}}]}}},
        });
        normalize_document(&mut doc).unwrap();
        let once = doc.clone();
        normalize_document(&mut doc).unwrap();
        assert_eq!(doc, once);
    }

    #[test]
    fn every_normalized_action_has_a_verb() {
        let mut doc = json!({
            "flows": {
                "f": [
                    {"flow_while": {"while": "x", "do": [{"increment": {"key": "n"}}]}},
                    {"try": {"do": [{"log": {"message": "a"}}], "finally": [{"log": {"message": "b"}}]}},
                ]
            }
        });
        normalize_document(&mut doc).unwrap();
        fn assert_verbs(v: &Value) {
            match v {
                Value::Array(items) => items.iter().for_each(assert_verbs),
                Value::Object(map) => {
                    if map.contains_key("action") {
                        assert!(map["action"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
                    }
                    map.values().for_each(assert_verbs);
                }
                _ => {}
            }
        }
        assert_verbs(&doc["flows"]);
    }
}
