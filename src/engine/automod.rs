// Weft Engine — Automod Engine
//
// Evaluates each enabled rule's trigger(s) against a message plus the
// sliding-window history for its (guild, channel, user) scope. Exemptions
// (user / role / channel / permission) and per-rule `when` guards run before
// any trigger. Matches are handed back so the caller can feed them through
// the executor with `automod = {rule, trigger, matched}` in context.
//
// Histories never grow without bound: entries older than the longest window
// any rule uses are discarded on every access, and two users or channels
// never share a window.

use crate::atoms::constants::{
    DEFAULT_CAPS_THRESHOLD, DEFAULT_EMOJI_THRESHOLD, DEFAULT_MENTION_THRESHOLD,
    DEFAULT_NEWLINE_THRESHOLD,
};
use crate::engine::context::ActionContext;
use crate::engine::expr::safety;
use crate::engine::expr::value::to_display_string;
use crate::engine::flow::FlowEngine;
use crate::engine::spec::{RuleSpec, TriggerSpec};
use crate::engine::storage::now_ms;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::OnceLock;

const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 60_000;

fn url_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"https?://[^\s<>]+").unwrap())
}

fn invite_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::RegexBuilder::new(r"(discord\.gg/|discordapp\.com/invite/)[A-Za-z0-9-]+")
            .case_insensitive(true)
            .build()
            .unwrap()
    })
}

fn mention_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"<@[!&]?\d+>").unwrap())
}

/// Rough unicode emoji check: the common emoji blocks plus regional
/// indicators.
fn is_emoji(c: char) -> bool {
    matches!(u32::from(c),
        0x1F300..=0x1FAFF
        | 0x2600..=0x27BF
        | 0x1F1E6..=0x1F1FF
        | 0x2B00..=0x2BFF
        | 0xFE0F
    )
}

// ── Results ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AutomodMatch {
    pub rule: String,
    pub trigger: &'static str,
    pub matched: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AutomodVerdict {
    pub passed: bool,
    pub matches: Vec<AutomodMatch>,
}

// ── History windows ────────────────────────────────────────────────────────

struct HistoryEntry {
    at_ms: i64,
    folded: String,
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct AutomodEngine {
    rules: RwLock<Vec<Arc<RuleSpec>>>,
    /// Per-(guild,channel,user) message history for spam/duplicate.
    histories: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
    /// Per-(rule,scope) match instants for escalation thresholds.
    escalations: Mutex<HashMap<String, VecDeque<i64>>>,
    /// Longest window any registered rule uses; bounds history growth.
    max_window_ms: RwLock<u64>,
}

impl AutomodEngine {
    pub fn new() -> Self {
        AutomodEngine {
            rules: RwLock::new(Vec::new()),
            histories: Mutex::new(HashMap::new()),
            escalations: Mutex::new(HashMap::new()),
            max_window_ms: RwLock::new(DEFAULT_DUPLICATE_WINDOW_MS),
        }
    }

    /// Replace the rule set.
    pub fn register_rules(&self, rules: &[RuleSpec]) {
        let mut max_window = DEFAULT_DUPLICATE_WINDOW_MS;
        for rule in rules {
            for trigger in &rule.trigger {
                let w = match trigger {
                    TriggerSpec::Spam { window, .. } => Some(*window),
                    TriggerSpec::Duplicate { window, .. } => {
                        Some(window.unwrap_or(DEFAULT_DUPLICATE_WINDOW_MS))
                    }
                    _ => None,
                };
                if let Some(w) = w {
                    max_window = max_window.max(w);
                }
            }
            if let Some(esc) = &rule.escalation {
                max_window = max_window.max(esc.window);
            }
        }
        *self.max_window_ms.write() = max_window;
        *self.rules.write() = rules.iter().map(|r| Arc::new(r.clone())).collect();
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Entries currently held for a scope (test hook for the boundedness
    /// invariant).
    pub fn history_len(&self, scope_key: &str) -> usize {
        self.histories.lock().get(scope_key).map(|h| h.len()).unwrap_or(0)
    }

    /// Check a message. Appends to the scope's history exactly once, prunes
    /// stale entries, then evaluates every enabled rule in declared order.
    pub async fn check(&self, content: &str, ctx: &ActionContext, flow: &FlowEngine) -> AutomodVerdict {
        self.check_at(content, ctx, flow, now_ms()).await
    }

    pub async fn check_at(
        &self,
        content: &str,
        ctx: &ActionContext,
        flow: &FlowEngine,
        now: i64,
    ) -> AutomodVerdict {
        let scope = ctx.scope_key();
        let max_window = *self.max_window_ms.read();

        // Record-then-count under the map lock so concurrent checks for the
        // same scope observe each other.
        let (spam_counts, duplicate_counts) = {
            let mut histories = self.histories.lock();
            let history = histories.entry(scope.clone()).or_default();
            history.push_back(HistoryEntry { at_ms: now, folded: content.to_lowercase() });
            while history.front().map(|e| now - e.at_ms > max_window as i64).unwrap_or(false) {
                history.pop_front();
            }
            let count_within = |window: u64| {
                history.iter().filter(|e| now - e.at_ms <= window as i64).count()
            };
            let dup_within = |window: u64, folded: &str| {
                history
                    .iter()
                    .filter(|e| now - e.at_ms <= window as i64 && e.folded == folded)
                    .count()
            };
            let folded = content.to_lowercase();
            // Capture counts per distinct window lazily below via closures is
            // not possible once the lock drops, so precompute for the rules.
            let rules = self.rules.read();
            let mut spam_counts: HashMap<u64, usize> = HashMap::new();
            let mut duplicate_counts: HashMap<u64, usize> = HashMap::new();
            for rule in rules.iter().filter(|r| r.enabled) {
                for trigger in &rule.trigger {
                    match trigger {
                        TriggerSpec::Spam { window, .. } => {
                            spam_counts.entry(*window).or_insert_with(|| count_within(*window));
                        }
                        TriggerSpec::Duplicate { window, .. } => {
                            let w = window.unwrap_or(DEFAULT_DUPLICATE_WINDOW_MS);
                            duplicate_counts.entry(w).or_insert_with(|| dup_within(w, &folded));
                        }
                        _ => {}
                    }
                }
            }
            (spam_counts, duplicate_counts)
        };

        let rules = self.rules.read().clone();
        let mut matches = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if self.is_exempt(rule, ctx) {
                continue;
            }
            if let Some(when) = &rule.when {
                if !flow.guard_passes(when, ctx).await {
                    continue;
                }
            }
            for trigger in &rule.trigger {
                let matched = match trigger {
                    TriggerSpec::Spam { threshold, window } => {
                        let count = spam_counts.get(window).copied().unwrap_or(0);
                        (count >= *threshold)
                            .then(|| vec![format!("{count} messages in {window}ms")])
                    }
                    TriggerSpec::Duplicate { threshold, window } => {
                        let w = window.unwrap_or(DEFAULT_DUPLICATE_WINDOW_MS);
                        let count = duplicate_counts.get(&w).copied().unwrap_or(0);
                        (count >= *threshold)
                            .then(|| vec![format!("{count} duplicates in {w}ms")])
                    }
                    other => evaluate_trigger(other, content, ctx),
                };
                if let Some(matched) = matched {
                    log::info!(
                        "[automod] Rule '{}' trigger '{}' matched: {matched:?}",
                        rule.name,
                        trigger.kind()
                    );
                    matches.push(AutomodMatch {
                        rule: rule.name.clone(),
                        trigger: trigger.kind(),
                        matched,
                    });
                }
            }
        }

        AutomodVerdict { passed: matches.is_empty(), matches }
    }

    fn is_exempt(&self, rule: &RuleSpec, ctx: &ActionContext) -> bool {
        if rule.exempt.is_empty() {
            return false;
        }
        let user_id = to_display_string(&ctx.get_path("user.id"));
        if !user_id.is_empty() && rule.exempt.users.contains(&user_id) {
            return true;
        }
        let channel_id = to_display_string(&ctx.get_path("channel.id"));
        if !channel_id.is_empty() && rule.exempt.channels.contains(&channel_id) {
            return true;
        }
        let roles = ctx.get_path("member.roles");
        let roles = match roles.as_array() {
            Some(r) => r.clone(),
            None => ctx.get_path("user.roles").as_array().cloned().unwrap_or_default(),
        };
        if roles.iter().any(|r| rule.exempt.roles.contains(&to_display_string(r))) {
            return true;
        }
        let perms = ctx.get_path("member.permissions");
        if let Some(perms) = perms.as_array() {
            if perms.iter().any(|p| rule.exempt.permissions.contains(&to_display_string(p))) {
                return true;
            }
        }
        false
    }

    /// Run the actions of every matched rule, with `automod` folded into the
    /// context. Escalation actions fire when a rule keeps matching inside
    /// its escalation window.
    pub async fn execute_actions(
        &self,
        verdict: &AutomodVerdict,
        ctx: &ActionContext,
        flow: &FlowEngine,
    ) {
        let rules = self.rules.read().clone();
        for automod_match in &verdict.matches {
            let Some(rule) = rules.iter().find(|r| r.name == automod_match.rule) else { continue };

            let mut match_ctx = ctx.clone();
            match_ctx.set(
                "automod",
                json!({
                    "rule": automod_match.rule,
                    "trigger": automod_match.trigger,
                    "matched": automod_match.matched,
                }),
            );
            flow.run_actions(&rule.actions, &mut match_ctx).await;

            if let Some(esc) = &rule.escalation {
                let key = format!("{}@{}", rule.name, ctx.scope_key());
                let now = now_ms();
                let due = {
                    let mut escalations = self.escalations.lock();
                    let hits = escalations.entry(key).or_default();
                    hits.push_back(now);
                    while hits.front().map(|t| now - t > esc.window as i64).unwrap_or(false) {
                        hits.pop_front();
                    }
                    hits.len() as u64 >= esc.threshold
                };
                if due {
                    log::info!("[automod] Rule '{}' escalation triggered", rule.name);
                    flow.run_actions(&esc.actions, &mut match_ctx).await;
                }
            }
        }
    }
}

impl Default for AutomodEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Stateless trigger evaluation ───────────────────────────────────────────

/// Evaluate a history-free trigger against the message. Returns the matched
/// tokens on a hit.
fn evaluate_trigger(
    trigger: &TriggerSpec,
    content: &str,
    ctx: &ActionContext,
) -> Option<Vec<String>> {
    match trigger {
        TriggerSpec::Keyword { keywords, allowed } => {
            let lower = content.to_lowercase();
            if allowed.iter().any(|a| lower.contains(&a.to_lowercase())) {
                return None;
            }
            let hits: Vec<String> = keywords
                .iter()
                .filter(|k| lower.contains(&k.to_lowercase()))
                .cloned()
                .collect();
            (!hits.is_empty()).then_some(hits)
        }

        TriggerSpec::Regex { regex } => {
            let mut hits = Vec::new();
            for pattern in regex {
                // Unsafe or invalid patterns are skipped, not compiled.
                let Some(re) = safety::compile_checked(pattern, true) else { continue };
                hits.extend(re.find_iter(content).map(|m| m.as_str().to_string()));
            }
            (!hits.is_empty()).then_some(hits)
        }

        TriggerSpec::Link { blocked, allowed } => {
            let mut hits = Vec::new();
            for url in url_re().find_iter(content).map(|m| m.as_str()) {
                let lower = url.to_lowercase();
                if blocked.iter().any(|b| lower.contains(&b.to_lowercase())) {
                    hits.push(url.to_string());
                } else if !allowed.is_empty() {
                    if !allowed.iter().any(|a| lower.contains(&a.to_lowercase())) {
                        hits.push(url.to_string());
                    }
                } else if blocked.is_empty() {
                    hits.push(url.to_string());
                }
            }
            (!hits.is_empty()).then_some(hits)
        }

        TriggerSpec::Invite => {
            let hits: Vec<String> =
                invite_re().find_iter(content).map(|m| m.as_str().to_string()).collect();
            (!hits.is_empty()).then_some(hits)
        }

        TriggerSpec::Caps { threshold } => {
            let threshold = threshold.unwrap_or(DEFAULT_CAPS_THRESHOLD);
            let letters: Vec<char> = content.chars().filter(|c| c.is_ascii_alphabetic()).collect();
            if letters.is_empty() {
                return None;
            }
            let upper = letters.iter().filter(|c| c.is_ascii_uppercase()).count();
            let pct = upper as f64 / letters.len() as f64 * 100.0;
            (pct >= threshold).then(|| vec![format!("{pct:.0}% caps")])
        }

        TriggerSpec::EmojiSpam { threshold } => {
            let threshold = threshold.unwrap_or(DEFAULT_EMOJI_THRESHOLD);
            let count = content.chars().filter(|c| is_emoji(*c)).count();
            (count >= threshold).then(|| vec![format!("{count} emoji")])
        }

        TriggerSpec::MentionSpam { threshold } => {
            let threshold = threshold.unwrap_or(DEFAULT_MENTION_THRESHOLD);
            let count = mention_re().find_iter(content).count();
            (count >= threshold).then(|| vec![format!("{count} mentions")])
        }

        TriggerSpec::NewlineSpam { threshold } => {
            let threshold = threshold.unwrap_or(DEFAULT_NEWLINE_THRESHOLD);
            let count = content.matches('\n').count();
            (count >= threshold).then(|| vec![format!("{count} newlines")])
        }

        TriggerSpec::Attachment { blocked, allowed, threshold } => {
            let attachments = ctx.get_path("attachments");
            let files: Vec<String> = attachments
                .as_array()
                .map(|a| {
                    a.iter()
                        .map(|f| {
                            to_display_string(
                                f.get("filename").or_else(|| f.get("name")).unwrap_or(f),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            if files.is_empty() {
                return None;
            }
            let mut hits = Vec::new();
            if let Some(cap) = threshold {
                if files.len() > *cap {
                    hits.push(format!("{} attachments", files.len()));
                }
            }
            for file in &files {
                let ext = file.rsplit('.').next().unwrap_or("").to_lowercase();
                if blocked.iter().any(|b| b.eq_ignore_ascii_case(&ext)) {
                    hits.push(file.clone());
                } else if !allowed.is_empty() && !allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext))
                {
                    hits.push(file.clone());
                }
            }
            (!hits.is_empty()).then_some(hits)
        }

        // History-backed triggers are handled by the engine.
        TriggerSpec::Spam { .. } | TriggerSpec::Duplicate { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builders::TemplateRegistry;
    use crate::engine::client::NullClient;
    use crate::engine::executor::Executor;
    use crate::engine::spec::parse_spec;
    use crate::engine::state::StateManager;
    use crate::engine::storage::memory::MemoryStorage;
    use crate::engine::timers::TimerManager;
    use crate::engine::voice::{NullVoiceBackend, VoiceManager};

    fn flow_engine() -> (FlowEngine, Arc<NullClient>) {
        let doc = parse_spec("{}").unwrap();
        let client = Arc::new(NullClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let (events_tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = Arc::new(Executor {
            client: client.clone(),
            storage: storage.clone(),
            state: Arc::new(StateManager::new(storage, &doc.state)),
            voice: Arc::new(VoiceManager::new(Arc::new(NullVoiceBackend::default()), 100, 100)),
            timers: Arc::new(TimerManager::new(events_tx.clone())),
            templates: Arc::new(TemplateRegistry::from_spec(&doc.components)),
            events_tx,
        });
        (FlowEngine::new(executor, doc.engine.clone()), client)
    }

    fn rules(yaml: &str) -> Vec<RuleSpec> {
        parse_spec(yaml).unwrap().automod.rules
    }

    fn msg_ctx(user: &str) -> ActionContext {
        let mut ctx = ActionContext::empty();
        ctx.set("guild", json!({"id": "g"}));
        ctx.set("channel", json!({"id": "c"}));
        ctx.set("user", json!({"id": user}));
        ctx
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: caps
      trigger: {type: caps}
      actions: []
"#,
        ));
        let verdict = engine.check("perfectly normal message", &msg_ctx("u"), &flow).await;
        assert!(verdict.passed);
        assert!(verdict.matches.is_empty());
    }

    #[tokio::test]
    async fn caps_trigger_reports_percentage() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: no-shouting
      trigger: {type: caps}
      actions: []
"#,
        ));
        let verdict = engine.check("THIS IS ALL CAPS MESSAGE", &msg_ctx("u"), &flow).await;
        assert!(!verdict.passed);
        assert!(verdict.matches[0].matched[0].contains("% caps"));
    }

    #[tokio::test]
    async fn keyword_with_allowed_suppression() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: words
      trigger: {type: keyword, keywords: [spoiler], allowed: ["spoiler alert"]}
      actions: []
"#,
        ));
        let hit = engine.check("big SPOILER here", &msg_ctx("u"), &flow).await;
        assert!(!hit.passed);
        let ok = engine.check("spoiler alert: it ends", &msg_ctx("u"), &flow).await;
        assert!(ok.passed);
    }

    #[tokio::test]
    async fn link_blocked_and_allowed_lists() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: links
      trigger: {type: link, allowed: [example.com]}
      actions: []
"#,
        ));
        let ok = engine.check("see https://example.com/docs", &msg_ctx("u"), &flow).await;
        assert!(ok.passed);
        let hit = engine.check("see https://evil.test/x", &msg_ctx("u"), &flow).await;
        assert!(!hit.passed);
    }

    #[tokio::test]
    async fn invite_trigger() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: invites
      trigger: {type: invite}
      actions: []
"#,
        ));
        let hit = engine.check("join discord.gg/abc123", &msg_ctx("u"), &flow).await;
        assert!(!hit.passed);
        assert_eq!(hit.matches[0].matched[0], "discord.gg/abc123");
    }

    #[tokio::test]
    async fn mention_and_newline_spam() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: mentions
      trigger: {type: mention_spam, threshold: 3}
      actions: []
    - name: newlines
      trigger: {type: newline_spam, threshold: 2}
      actions: []
"#,
        ));
        let hit = engine.check("<@1> <@2> <@&3>", &msg_ctx("u"), &flow).await;
        assert_eq!(hit.matches.len(), 1);
        assert_eq!(hit.matches[0].trigger, "mention_spam");
        let hit = engine.check("a\nb\nc", &msg_ctx("u"), &flow).await;
        assert_eq!(hit.matches[0].trigger, "newline_spam");
    }

    #[tokio::test]
    async fn regex_trigger_skips_unsafe_patterns() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: pattern
      trigger: {type: regex, regex: ["(a+)+", "b[0-9]+"]}
      actions: []
"#,
        ));
        // Only the safe pattern participates.
        let hit = engine.check("b42 aaaa", &msg_ctx("u"), &flow).await;
        assert!(!hit.passed);
        assert_eq!(hit.matches[0].matched, vec!["b42".to_string()]);
    }

    #[tokio::test]
    async fn spam_counts_within_scope_window() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: flood
      trigger: {type: spam, threshold: 3, window: 10000}
      actions: []
"#,
        ));
        let ctx = msg_ctx("u");
        let t0 = 1_000_000;
        assert!(engine.check_at("one", &ctx, &flow, t0).await.passed);
        assert!(engine.check_at("two", &ctx, &flow, t0 + 100).await.passed);
        let third = engine.check_at("three", &ctx, &flow, t0 + 200).await;
        assert!(!third.passed);
        assert_eq!(third.matches[0].trigger, "spam");
        // A different user never shares the window.
        assert!(engine.check_at("hello", &msg_ctx("v"), &flow, t0 + 300).await.passed);
    }

    #[tokio::test]
    async fn duplicate_counts_case_folded() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: dupes
      trigger: {type: duplicate, threshold: 2, window: 10000}
      actions: []
"#,
        ));
        let ctx = msg_ctx("u");
        let t0 = 2_000_000;
        assert!(engine.check_at("Buy Now", &ctx, &flow, t0).await.passed);
        let second = engine.check_at("BUY NOW", &ctx, &flow, t0 + 100).await;
        assert!(!second.passed);
        // Different content does not count as a duplicate.
        assert!(engine.check_at("something else", &ctx, &flow, t0 + 200).await.passed);
    }

    #[tokio::test]
    async fn histories_stay_bounded() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: flood
      trigger: {type: spam, threshold: 100, window: 1000}
      actions: []
"#,
        ));
        let ctx = msg_ctx("u");
        let t0: i64 = 10_000_000;
        for i in 0..50 {
            engine.check_at("m", &ctx, &flow, t0 + i * 10_000).await;
        }
        // Every check is 10s apart with a 60s max window: at most 7 live.
        assert!(engine.history_len(&ctx.scope_key()) <= 7);
    }

    #[tokio::test]
    async fn exemptions_skip_rules() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: caps
      trigger: {type: caps}
      exempt: {users: [boss], roles: [mods]}
      actions: []
"#,
        ));
        assert!(engine.check("SHOUTING LOUDLY", &msg_ctx("boss"), &flow).await.passed);
        let mut modded = msg_ctx("u");
        modded.set("member", json!({"roles": ["mods"]}));
        assert!(engine.check("SHOUTING LOUDLY", &modded, &flow).await.passed);
        assert!(!engine.check("SHOUTING LOUDLY", &msg_ctx("u"), &flow).await.passed);
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: caps
      enabled: false
      trigger: {type: caps}
      actions: []
"#,
        ));
        assert!(engine.check("ALL CAPS", &msg_ctx("u"), &flow).await.passed);
    }

    #[tokio::test]
    async fn attachment_extension_rules() {
        let (flow, _) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: files
      trigger: {type: attachment, blocked: [exe]}
      actions: []
"#,
        ));
        let mut ctx = msg_ctx("u");
        ctx.set("attachments", json!([{"filename": "setup.exe"}, {"filename": "pic.png"}]));
        let verdict = engine.check("see file", &ctx, &flow).await;
        assert!(!verdict.passed);
        assert_eq!(verdict.matches[0].matched, vec!["setup.exe".to_string()]);
    }

    #[tokio::test]
    async fn matched_rules_run_their_actions_with_automod_context() {
        let (flow, client) = flow_engine();
        let engine = AutomodEngine::new();
        engine.register_rules(&rules(
            r#"
automod:
  rules:
    - name: caps
      trigger: {type: caps}
      actions:
        - send_message: {channel: c, content: "rule ${automod.rule} (${automod.trigger})"}
"#,
        ));
        let ctx = msg_ctx("u");
        let verdict = engine.check("STOP SHOUTING", &ctx, &flow).await;
        engine.execute_actions(&verdict, &ctx, &flow).await;
        let sent = client.calls_named("send_message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args["msg"]["content"], json!("rule caps (caps)"));
    }
}
