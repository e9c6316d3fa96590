// Weft Engine — Action handlers
//
// One sub-module per verb domain. Handlers receive interpolated parameter
// bags and read missing pieces (guild, channel, user, message) from the
// action context.

pub mod control;
pub mod messaging;
pub mod moderation;
pub mod state;
pub mod voice;

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::context::ActionContext;
use crate::engine::expr::value::{as_number, to_display_string};
use serde_json::{Map, Value};

/// Optional string parameter, stringified when present and non-null.
pub(crate) fn p_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_null()).map(to_display_string)
}

/// Required string parameter.
pub(crate) fn req_str(
    params: &Map<String, Value>,
    key: &str,
    verb: &str,
) -> EngineResult<String> {
    p_str(params, key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::parameter(format!("'{verb}' requires '{key}'")))
}

pub(crate) fn p_u64(params: &Map<String, Value>, key: &str) -> Option<u64> {
    params.get(key).and_then(as_number).map(|f| f.max(0.0) as u64)
}

pub(crate) fn p_bool(params: &Map<String, Value>, key: &str) -> bool {
    params.get(key).map(crate::engine::expr::value::is_truthy).unwrap_or(false)
}

/// First present key among aliases.
pub(crate) fn p_str_any(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| p_str(params, k)).filter(|s| !s.is_empty())
}

/// Context ID fallback: a parameter, else a dot-path into the context.
pub(crate) fn id_or_ctx(
    params: &Map<String, Value>,
    keys: &[&str],
    ctx: &ActionContext,
    ctx_path: &str,
    verb: &str,
) -> EngineResult<String> {
    if let Some(id) = p_str_any(params, keys) {
        return Ok(id);
    }
    let fallback = to_display_string(&ctx.get_path(ctx_path));
    if fallback.is_empty() {
        return Err(EngineError::parameter(format!(
            "'{verb}' needs one of {keys:?} or {ctx_path} in context"
        )));
    }
    Ok(fallback)
}

/// Parse a duration parameter: a bare number is milliseconds, strings accept
/// `30s`, `5m`, `2h`, `7d`.
pub(crate) fn parse_duration_ms(v: &Value) -> Option<u64> {
    if let Some(n) = as_number(v) {
        return Some(n.max(0.0) as u64);
    }
    let s = v.as_str()?.trim().to_lowercase();
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let n: f64 = digits.trim().parse().ok()?;
    let ms = match unit {
        "s" => n * 1_000.0,
        "m" => n * 60_000.0,
        "h" => n * 3_600_000.0,
        "d" => n * 86_400_000.0,
        _ => s.parse::<f64>().ok()?,
    };
    Some(ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_ms(&json!(1500)), Some(1500));
        assert_eq!(parse_duration_ms(&json!("30s")), Some(30_000));
        assert_eq!(parse_duration_ms(&json!("5m")), Some(300_000));
        assert_eq!(parse_duration_ms(&json!("2h")), Some(7_200_000));
        assert_eq!(parse_duration_ms(&json!("1d")), Some(86_400_000));
        assert_eq!(parse_duration_ms(&json!("250")), Some(250));
        assert_eq!(parse_duration_ms(&json!("soon")), None);
    }

    #[test]
    fn required_params_reject_empty() {
        let mut params = Map::new();
        params.insert("user".into(), json!(""));
        assert!(req_str(&params, "user", "kick").is_err());
        params.insert("user".into(), json!("42"));
        assert_eq!(req_str(&params, "user", "kick").unwrap(), "42");
    }
}
