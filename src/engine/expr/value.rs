// Weft Engine — Expression value helpers
//
// Expression values are plain `serde_json::Value` (the exact
// null | bool | number | string | array | object sum the evaluator needs).
// This module holds the coercion and comparison rules shared by the parser,
// the evaluator, and the transform table.

use serde_json::Value;
use std::cmp::Ordering;

/// Truthiness, JS-style: null, false, 0, NaN and "" are falsy.
/// Arrays and objects are always truthy, even when empty.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way interpolation does: strings bare, null as empty,
/// everything else as compact JSON.
pub fn to_display_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Numeric view of a value, if it has one. Strings parse when they look like
/// numbers; booleans count as 0/1.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Build a number value, preferring integer representation when exact.
pub fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Loose equality: numbers compare numerically across representations,
/// everything else compares structurally.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        // A number against a numeric string compares numerically (IDs arrive
        // as strings from the platform, as numbers from YAML).
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// Ordering for `<`, `<=`, `>`, `>=`: numeric when both sides are numeric,
/// lexicographic for string pairs, absent otherwise.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Dot-path lookup into a value: `get_path(v, "user.roles.0")`.
/// Missing segments yield `Null`, never an error.
pub fn get_path<'a>(v: &'a Value, path: &str) -> &'a Value {
    let mut cur = v;
    for seg in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(seg).unwrap_or(&Value::Null),
            Value::Array(items) => seg
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!(-1)));
    }

    #[test]
    fn display_strings() {
        assert_eq!(to_display_string(&Value::Null), "");
        assert_eq!(to_display_string(&json!("hi")), "hi");
        assert_eq!(to_display_string(&json!(3)), "3");
        assert_eq!(to_display_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn loose_equality_across_representations() {
        assert!(loose_eq(&json!(5), &json!(5.0)));
        assert!(loose_eq(&json!(5), &json!("5")));
        assert!(loose_eq(&json!("abc"), &json!("abc")));
        assert!(!loose_eq(&json!("abc"), &json!(5)));
    }

    #[test]
    fn path_lookup() {
        let v = json!({"user": {"roles": ["admin", "mod"]}});
        assert_eq!(get_path(&v, "user.roles.1"), &json!("mod"));
        assert_eq!(get_path(&v, "user.missing.deep"), &Value::Null);
    }
}
