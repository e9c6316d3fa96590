// Weft Engine — Runtime pattern safety gate
//
// Any transform or automod trigger that compiles a user-supplied pattern at
// runtime goes through `check_pattern` first. Rejected patterns fall back to
// literal substring behavior at the call site; they are never compiled.
//
// Rejection rules:
//   • longer than MAX_PATTERN_LENGTH
//   • nested quantifiers:            (a+)+  (x*)* …
//   • quantified alternation groups: (a|b)+ …
//   • quantified back-references:    \1+ …

use crate::atoms::constants::MAX_PATTERN_LENGTH;
use std::sync::OnceLock;

fn nested_quantifier_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\([^)]*[+*][^)]*\)[+*]").unwrap())
}

fn quantified_alternation_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\([^)]*\|[^)]*\)[+*]").unwrap())
}

fn quantified_backref_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\\[0-9][+*]").unwrap())
}

/// Why a pattern was rejected. Used for log messages only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRejection {
    TooLong,
    NestedQuantifier,
    QuantifiedAlternation,
    QuantifiedBackref,
}

impl std::fmt::Display for PatternRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternRejection::TooLong => "pattern exceeds length limit",
            PatternRejection::NestedQuantifier => "nested quantifier",
            PatternRejection::QuantifiedAlternation => "quantified alternation group",
            PatternRejection::QuantifiedBackref => "quantified back-reference",
        };
        f.write_str(s)
    }
}

/// Check a pattern against the safety rules. `Ok(())` means it may be
/// compiled; `Err` names the first rule it broke.
pub fn check_pattern(pattern: &str) -> Result<(), PatternRejection> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(PatternRejection::TooLong);
    }
    if nested_quantifier_re().is_match(pattern) {
        return Err(PatternRejection::NestedQuantifier);
    }
    if quantified_alternation_re().is_match(pattern) {
        return Err(PatternRejection::QuantifiedAlternation);
    }
    if quantified_backref_re().is_match(pattern) {
        return Err(PatternRejection::QuantifiedBackref);
    }
    Ok(())
}

/// Compile a pattern after the safety check.
/// Returns `None` for unsafe or syntactically invalid patterns.
pub fn compile_checked(pattern: &str, case_insensitive: bool) -> Option<regex::Regex> {
    if let Err(reason) = check_pattern(pattern) {
        log::warn!("[expr] Rejected unsafe pattern ({reason}): {}", &pattern[..pattern.len().min(80)]);
        return None;
    }
    match regex::RegexBuilder::new(pattern).case_insensitive(case_insensitive).build() {
        Ok(re) => Some(re),
        Err(e) => {
            log::warn!("[expr] Invalid pattern: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_patterns() {
        assert!(check_pattern(r"hello\s+world").is_ok());
        assert!(check_pattern(r"[a-z]{3,10}@example\.com").is_ok());
    }

    #[test]
    fn rejects_oversized() {
        let p = "a".repeat(501);
        assert_eq!(check_pattern(&p), Err(PatternRejection::TooLong));
    }

    #[test]
    fn rejects_nested_quantifiers() {
        assert_eq!(check_pattern("(a+)+"), Err(PatternRejection::NestedQuantifier));
        assert_eq!(check_pattern("(x*)*"), Err(PatternRejection::NestedQuantifier));
    }

    #[test]
    fn rejects_quantified_alternation() {
        assert_eq!(check_pattern("(a|b)+"), Err(PatternRejection::QuantifiedAlternation));
    }

    #[test]
    fn rejects_quantified_backrefs() {
        assert_eq!(check_pattern(r"(a)\1+"), Err(PatternRejection::QuantifiedBackref));
    }

    #[test]
    fn compile_falls_back_to_none() {
        assert!(compile_checked("(a+)+", true).is_none());
        assert!(compile_checked("[unclosed", true).is_none());
        assert!(compile_checked("simple", true).is_some());
    }
}
