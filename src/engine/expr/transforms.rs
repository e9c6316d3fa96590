// Weft Engine — Pipe transform table
//
// The fixed set of transforms reachable from expressions, both in pipe form
// (`name | upper`) and call form (`upper(name)`). One match arm per
// transform; there is no runtime registration.

use super::safety;
use super::value::{as_number, is_truthy, number, to_display_string};
use crate::atoms::constants::MAX_JSON_DEPTH;
use crate::atoms::error::{EngineError, EngineResult};
use chrono::TimeZone;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

/// Apply transform `name` to `input` with the given arguments.
/// Unknown names are an expression error; type mismatches are mostly lenient
/// (they yield `null`) so a template never hard-fails on absent data.
pub fn apply(name: &str, input: Value, args: &[Value]) -> EngineResult<Value> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    let arg_str = |i: usize| args.get(i).map(to_display_string);

    let out = match name {
        // ── String ─────────────────────────────────────────────────────
        "lower" => Value::String(to_display_string(&input).to_lowercase()),
        "upper" => Value::String(to_display_string(&input).to_uppercase()),
        "capitalize" => {
            let s = to_display_string(&input);
            let mut chars = s.chars();
            Value::String(match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            })
        }
        "trim" => Value::String(to_display_string(&input).trim().to_string()),
        "truncate" => {
            let s = to_display_string(&input);
            let n = as_number(&arg(0)).unwrap_or(50.0).max(0.0) as usize;
            let suffix = arg_str(1).unwrap_or_else(|| "...".to_string());
            if s.chars().count() <= n {
                Value::String(s)
            } else {
                let cut: String = s.chars().take(n).collect();
                Value::String(cut + &suffix)
            }
        }
        "split" => {
            let s = to_display_string(&input);
            let d = arg_str(0).unwrap_or_else(|| ",".to_string());
            Value::Array(s.split(&d).map(|p| Value::String(p.to_string())).collect())
        }
        "replace" => {
            let s = to_display_string(&input);
            let search = arg_str(0).unwrap_or_default();
            let repl = arg_str(1).unwrap_or_default();
            match safety::compile_checked(&search, false) {
                Some(re) => Value::String(re.replace_all(&s, repl.as_str()).into_owned()),
                // Unsafe or invalid pattern: literal substring behavior.
                None => Value::String(s.replace(&search, &repl)),
            }
        }
        "padStart" | "padEnd" => {
            let s = to_display_string(&input);
            let n = as_number(&arg(0)).unwrap_or(0.0).max(0.0) as usize;
            let ch = arg_str(1).filter(|c| !c.is_empty()).unwrap_or_else(|| " ".to_string());
            let fill_ch = ch.chars().next().unwrap_or(' ');
            let len = s.chars().count();
            if len >= n {
                Value::String(s)
            } else {
                let pad: String = std::iter::repeat(fill_ch).take(n - len).collect();
                Value::String(if name == "padStart" { pad + &s } else { s + &pad })
            }
        }
        "includes" | "contains" => match &input {
            Value::Array(items) => {
                let needle = arg(0);
                Value::Bool(items.iter().any(|v| super::value::loose_eq(v, &needle)))
            }
            _ => {
                let s = to_display_string(&input);
                Value::Bool(s.contains(&arg_str(0).unwrap_or_default()))
            }
        },
        "startsWith" => {
            let s = to_display_string(&input);
            Value::Bool(s.starts_with(&arg_str(0).unwrap_or_default()))
        }
        "endsWith" => {
            let s = to_display_string(&input);
            Value::Bool(s.ends_with(&arg_str(0).unwrap_or_default()))
        }

        // ── Array ──────────────────────────────────────────────────────
        "join" => {
            let d = arg_str(0).unwrap_or_else(|| ", ".to_string());
            match input {
                Value::Array(items) => Value::String(
                    items.iter().map(to_display_string).collect::<Vec<_>>().join(&d),
                ),
                other => other,
            }
        }
        "first" => match input {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next().map(|c| Value::String(c.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "last" => match input {
            Value::Array(items) => items.into_iter().next_back().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next_back().map(|c| Value::String(c.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "nth" => {
            let n = as_number(&arg(0)).unwrap_or(0.0) as i64;
            match input {
                Value::Array(items) => {
                    let idx = if n < 0 { items.len() as i64 + n } else { n };
                    if idx >= 0 && (idx as usize) < items.len() {
                        items.into_iter().nth(idx as usize).unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    }
                }
                _ => Value::Null,
            }
        }
        "slice" => {
            let a = as_number(&arg(0)).unwrap_or(0.0) as i64;
            let b = args.get(1).and_then(as_number).map(|f| f as i64);
            match input {
                Value::Array(items) => {
                    let (from, to) = slice_bounds(items.len(), a, b);
                    Value::Array(items[from..to].to_vec())
                }
                Value::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let (from, to) = slice_bounds(chars.len(), a, b);
                    Value::String(chars[from..to].iter().collect())
                }
                _ => Value::Null,
            }
        }
        "reverse" => match input {
            Value::Array(mut items) => {
                items.reverse();
                Value::Array(items)
            }
            Value::String(s) => Value::String(s.chars().rev().collect()),
            other => other,
        },
        "sort" => match input {
            Value::Array(mut items) => {
                let key = arg_str(0);
                items.sort_by(|a, b| {
                    let (x, y) = match &key {
                        Some(k) => (super::value::get_path(a, k), super::value::get_path(b, k)),
                        None => (a, b),
                    };
                    super::value::compare(x, y).unwrap_or(std::cmp::Ordering::Equal)
                });
                Value::Array(items)
            }
            other => other,
        },
        "unique" => match input {
            Value::Array(items) => {
                let mut seen: Vec<Value> = Vec::new();
                for item in items {
                    if !seen.iter().any(|s| s == &item) {
                        seen.push(item);
                    }
                }
                Value::Array(seen)
            }
            other => other,
        },
        "flatten" => match input {
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    match item {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                Value::Array(out)
            }
            other => other,
        },
        "filter" => {
            let key = arg_str(0).unwrap_or_default();
            let want = arg(1);
            match input {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .filter(|item| {
                            let got = super::value::get_path(item, &key);
                            if want.is_null() { is_truthy(got) } else { super::value::loose_eq(got, &want) }
                        })
                        .collect(),
                ),
                _ => Value::Null,
            }
        }
        "map" | "pluck" => {
            let key = arg_str(0).unwrap_or_default();
            match input {
                Value::Array(items) => Value::Array(
                    items.iter().map(|item| super::value::get_path(item, &key).clone()).collect(),
                ),
                _ => Value::Null,
            }
        }
        "pick" => match input {
            Value::Array(items) if !items.is_empty() => {
                let i = rand::thread_rng().gen_range(0..items.len());
                items.into_iter().nth(i).unwrap_or(Value::Null)
            }
            _ => Value::Null,
        },
        "shuffle" => match input {
            Value::Array(mut items) => {
                items.shuffle(&mut rand::thread_rng());
                Value::Array(items)
            }
            other => other,
        },

        // ── Number ─────────────────────────────────────────────────────
        "round" => {
            let d = as_number(&arg(0)).unwrap_or(0.0).max(0.0) as u32;
            match as_number(&input) {
                Some(f) => {
                    let m = 10f64.powi(d as i32);
                    number((f * m).round() / m)
                }
                None => Value::Null,
            }
        }
        "floor" => as_number(&input).map(|f| number(f.floor())).unwrap_or(Value::Null),
        "ceil" => as_number(&input).map(|f| number(f.ceil())).unwrap_or(Value::Null),
        "abs" => as_number(&input).map(|f| number(f.abs())).unwrap_or(Value::Null),
        "format" => match as_number(&input) {
            // Only en-US style grouping is implemented; the locale argument
            // is accepted for spec compatibility.
            Some(f) => Value::String(format_grouped(f)),
            None => Value::Null,
        },
        "ordinal" => match as_number(&input) {
            Some(f) => {
                let n = f as i64;
                let suffix = match (n % 10, n % 100) {
                    (1, 11) | (2, 12) | (3, 13) => "th",
                    (1, _) => "st",
                    (2, _) => "nd",
                    (3, _) => "rd",
                    _ => "th",
                };
                Value::String(format!("{n}{suffix}"))
            }
            None => Value::Null,
        },

        // ── Object ─────────────────────────────────────────────────────
        "keys" => match input {
            Value::Object(map) => Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()),
            _ => Value::Array(vec![]),
        },
        "values" => match input {
            Value::Object(map) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
            _ => Value::Array(vec![]),
        },
        "entries" => match input {
            Value::Object(map) => Value::Array(
                map.into_iter().map(|(k, v)| Value::Array(vec![Value::String(k), v])).collect(),
            ),
            _ => Value::Array(vec![]),
        },
        "get" => {
            let path = arg_str(0).unwrap_or_default();
            let got = super::value::get_path(&input, &path).clone();
            if got.is_null() { arg(1) } else { got }
        }

        // ── Type coercion ──────────────────────────────────────────────
        "string" => Value::String(to_display_string(&input)),
        "number" | "float" => as_number(&input).map(number).unwrap_or(Value::Null),
        "int" => as_number(&input).map(|f| Value::from(f.trunc() as i64)).unwrap_or(Value::Null),
        "boolean" => Value::Bool(is_truthy(&input)),
        "json" => Value::String(stringify_guarded(&input)),

        // ── Utility ────────────────────────────────────────────────────
        "default" => {
            let empty = matches!(&input, Value::Null) || matches!(&input, Value::String(s) if s.is_empty());
            if empty { arg(0) } else { input }
        }
        "length" | "size" => Value::from(match &input {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        }),

        // ── Date ───────────────────────────────────────────────────────
        "timestamp" => {
            let secs = epoch_seconds(&input);
            match arg_str(0).as_deref() {
                None | Some("") => Value::from(secs),
                Some(fmt) => Value::String(format!("<t:{}:{}>", secs, timestamp_marker(fmt))),
            }
        }
        "duration" => match as_number(&input) {
            Some(ms) => Value::String(humanize_duration(ms as i64)),
            None => Value::Null,
        },

        // ── Platform ───────────────────────────────────────────────────
        "mention" => {
            let id = to_display_string(&input);
            match arg_str(0).as_deref() {
                Some("role") => Value::String(format!("<@&{id}>")),
                Some("channel") => Value::String(format!("<#{id}>")),
                // Emoji mentions take "name:id" input.
                Some("emoji") => Value::String(format!("<:{id}>")),
                _ => Value::String(format!("<@{id}>")),
            }
        }
        "pluralize" => {
            let count = as_number(&input).unwrap_or(0.0);
            let singular = arg_str(0).unwrap_or_default();
            let plural = arg_str(1).unwrap_or_else(|| format!("{singular}s"));
            Value::String(if count == 1.0 { singular } else { plural })
        }

        other => {
            return Err(EngineError::expression(format!("unknown transform '{other}'")));
        }
    };
    Ok(out)
}

/// Clamp JS-style slice bounds (negative = from the end) into a valid range.
fn slice_bounds(len: usize, a: i64, b: Option<i64>) -> (usize, usize) {
    let norm = |i: i64| -> usize {
        if i < 0 { (len as i64 + i).max(0) as usize } else { (i as usize).min(len) }
    };
    let from = norm(a);
    let to = norm(b.unwrap_or(len as i64)).max(from);
    (from, to)
}

/// en-US style thousands grouping: 1234567.5 → "1,234,567.5".
fn format_grouped(f: f64) -> String {
    let raw = if f.fract() == 0.0 { format!("{}", f as i64) } else { format!("{f}") };
    let (int_part, frac_part) = match raw.split_once('.') {
        Some((i, fr)) => (i.to_string(), Some(fr.to_string())),
        None => (raw, None),
    };
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part.as_str()),
    };
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac_part {
        Some(fr) => format!("{sign}{grouped}.{fr}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Interpret an input as seconds since epoch. Numbers above ~5e10 are taken
/// as milliseconds (the stored-timestamp convention); RFC 3339 strings parse;
/// anything else means "now".
fn epoch_seconds(v: &Value) -> i64 {
    if let Some(f) = as_number(v) {
        let n = f as i64;
        return if n.abs() > 50_000_000_000 { n / 1000 } else { n };
    }
    if let Value::String(s) = v {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return dt.timestamp();
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return chrono::Utc.from_utc_datetime(&naive).timestamp();
        }
    }
    chrono::Utc::now().timestamp()
}

/// Map a named timestamp format to its platform marker character.
fn timestamp_marker(fmt: &str) -> char {
    match fmt {
        "short_time" => 't',
        "long_time" => 'T',
        "short_date" => 'd',
        "long_date" => 'D',
        "short_datetime" => 'f',
        "long_datetime" => 'F',
        "relative" => 'R',
        // Single-letter markers pass through unchanged.
        s if s.len() == 1 => s.chars().next().unwrap_or('f'),
        _ => 'f',
    }
}

/// Humanize a millisecond duration: "2d 5h", "3h 12m", "4m 9s", "45s".
fn humanize_duration(ms: i64) -> String {
    let total_secs = (ms / 1000).max(0);
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let mins = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Stringify with a traversal depth bound. `serde_json::Value` cannot be
/// cyclic, so the bound only trips on adversarially deep trees; past it the
/// subtree is rendered as the literal `"[Circular]"` marker.
pub fn stringify_guarded(v: &Value) -> String {
    fn walk(v: &Value, depth: usize, out: &mut String) {
        if depth > MAX_JSON_DEPTH {
            out.push_str("\"[Circular]\"");
            return;
        }
        match v {
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    walk(item, depth + 1, out);
                }
                out.push(']');
            }
            Value::Object(map) => {
                out.push('{');
                for (i, (k, val)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(k).unwrap_or_default());
                    out.push(':');
                    walk(val, depth + 1, out);
                }
                out.push('}');
            }
            leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
        }
    }
    let mut out = String::new();
    walk(v, 0, &mut out);
    out
}
