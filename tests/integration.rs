// End-to-end scenarios: a full spec document parsed, normalized, and run
// against the recording client.

use std::sync::Arc;

use serde_json::{json, Value};
use weft::engine::client::{InteractionHandle, NullClient};
use weft::engine::context::ActionContext;
use weft::engine::runtime::Engine;
use weft::engine::scheduler::parse_cron;
use weft::engine::spec::parse_spec;
use weft::engine::storage::memory::MemoryStorage;
use weft::engine::voice::{LoopMode, NullVoiceBackend, QueueItem, QueuePosition};

async fn engine_from(yaml: &str) -> (Arc<Engine>, Arc<NullClient>) {
    let doc = parse_spec(yaml).expect("spec parses");
    let client = Arc::new(NullClient::new());
    let engine = Engine::new(
        doc,
        client.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(NullVoiceBackend::default()),
    )
    .await
    .expect("engine builds");
    (Arc::new(engine), client)
}

fn interaction(n: &str) -> InteractionHandle {
    InteractionHandle::new(n, "token")
}

fn reply_contents(client: &NullClient) -> Vec<String> {
    client
        .calls_named("reply_interaction")
        .iter()
        .map(|c| c.args["msg"]["content"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ── Scenario 1: command echo ───────────────────────────────────────────────

#[tokio::test]
async fn command_echo() {
    let (engine, client) = engine_from(
        r#"
identity: {name: echo-bot}
commands:
  - name: echo
    description: Echo the input
    options:
      - {name: text, type: string, required: true}
    actions:
      - reply:
          content: "You said: ${args.text}"
"#,
    )
    .await;

    let handled = engine
        .handle_command("echo", None, json!({"args": {"text": "Hello World"}}), interaction("i1"))
        .await;

    assert!(handled);
    assert_eq!(reply_contents(&client), vec!["You said: Hello World".to_string()]);
}

// ── Scenario 2: conditional branch ─────────────────────────────────────────

#[tokio::test]
async fn conditional_branch_replies_once() {
    let (engine, client) = engine_from(
        r#"
commands:
  - name: admin
    actions:
      - reply: {content: "Admin access granted"}
        when: "user.id == '12345'"
      - reply: {content: "Access denied"}
        when: "user.id != '12345'"
"#,
    )
    .await;

    engine
        .handle_command("admin", None, json!({"user": {"id": "12345"}}), interaction("i2"))
        .await;

    assert_eq!(reply_contents(&client), vec!["Admin access granted".to_string()]);
}

// ── Scenario 3: flow recursion depth ───────────────────────────────────────

#[tokio::test]
async fn recursive_flow_stops_at_depth_cap() {
    let (engine, client) = engine_from(
        r#"
engine: {max_flow_depth: 3}
flows:
  recursive:
    actions:
      - send_message: {channel: c, content: "tick"}
      - call_flow: {flow: recursive}
"#,
    )
    .await;

    let result = engine
        .flow
        .execute_flow("recursive", serde_json::Map::new(), &ActionContext::empty(), 0)
        .await
        .expect("no uncaught error escapes");

    assert!(result.success);
    assert_eq!(client.calls_named("send_message").len(), 3);
}

// ── Scenario 4: automod caps trigger ───────────────────────────────────────

#[tokio::test]
async fn automod_caps_trigger() {
    let (engine, _) = engine_from(
        r#"
automod:
  rules:
    - name: no-shouting
      trigger: {type: caps}
      actions: []
"#,
    )
    .await;

    let mut ctx = ActionContext::empty();
    ctx.set("guild", json!({"id": "g"}));
    ctx.set("channel", json!({"id": "c"}));
    ctx.set("user", json!({"id": "u"}));
    let verdict = engine.automod.check("THIS IS ALL CAPS MESSAGE", &ctx, &engine.flow).await;

    assert!(!verdict.passed);
    assert!(verdict.matches[0].matched[0].contains("% caps"));
}

// ── Scenario 5: cron field parsing ─────────────────────────────────────────

#[tokio::test]
async fn cron_every_fifteen_minutes() {
    let spec = parse_cron("*/15 * * * *").unwrap();
    let now = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:03:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let next = spec.next_run(now, chrono_tz::Tz::UTC);
    assert_eq!(next.to_rfc3339(), "2025-01-01T00:15:00+00:00");
}

// ── Scenario 6: queue loop mode ────────────────────────────────────────────

#[tokio::test]
async fn queue_loop_reenqueues_finished_track() {
    let (engine, _) = engine_from("voice: {max_queue_size: 10}").await;
    let voice = &engine.flow.executor.voice;

    let track = |name: &str| QueueItem {
        url: format!("https://t/{name}"),
        title: name.to_string(),
        duration_ms: None,
        thumbnail: None,
        requester_id: None,
    };

    voice.join("g", "vc", false, false).await.unwrap();
    voice.play("g", track("A"), None, 0).await.unwrap();
    voice.add_to_queue("g", track("B"), QueuePosition::Last).unwrap();
    voice.set_loop("g", LoopMode::Queue).unwrap();

    let now_playing = engine.flow.executor.voice.handle_track_end("g").await.unwrap().unwrap();
    assert_eq!(now_playing.title, "B");
    let status = voice.status("g").unwrap();
    assert_eq!(status.queue.len(), 1);
    assert_eq!(status.queue[0].title, "A");
}

// ── Full-document lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn warns_accumulate_through_state_and_tables() {
    let (engine, client) = engine_from(
        r#"
state:
  variables:
    warn_count: {type: number, scope: member, default: 0}
  tables:
    warns:
      columns:
        id: {type: string, primary: true}
        user_id: {type: string, index: true}
        reason: {type: string}
commands:
  - name: warn
    options:
      - {name: reason, type: string, required: true}
    actions:
      - increment: {name: warn_count}
      - db_insert:
          table: warns
          row: {id: "${user.id}-${warn_count}", user_id: "${user.id}", reason: "${args.reason}"}
      - reply: {content: "Warning ${warn_count} recorded"}
      - flow_if:
          if: "warn_count >= 2"
          then:
            - kick: {reason: "too many warnings"}
"#,
    )
    .await;

    let ctx = json!({
        "guild": {"id": "g1"}, "channel": {"id": "c1"},
        "user": {"id": "u1"},
        "args": {"reason": "spamming"},
    });
    engine.handle_command("warn", None, ctx.clone(), interaction("w1")).await;
    engine.handle_command("warn", None, ctx, interaction("w2")).await;

    let replies = reply_contents(&client);
    assert_eq!(replies, vec!["Warning 1 recorded".to_string(), "Warning 2 recorded".to_string()]);
    // The second warning crossed the threshold.
    let kicks = client.calls_named("kick");
    assert_eq!(kicks.len(), 1);
    assert_eq!(kicks[0].args["user_id"], json!("u1"));
}

#[tokio::test]
async fn event_handler_with_batch_and_flow_call() {
    let (engine, client) = engine_from(
        r#"
flows:
  announce:
    parameters:
      - {name: text, type: string, required: true}
    actions:
      - send_message: {channel: mod-log, content: "${args.text}"}
events:
  guild_member_add:
    - call_flow: {flow: announce, args: {text: "welcome ${user.username}"}}
"#,
    )
    .await;

    let ran = engine
        .handle_event("member_join", json!({"user": {"id": "9", "username": "ada"}}))
        .await;
    assert_eq!(ran, 1);
    let sent = client.calls_named("send_message");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].args["msg"]["content"], json!("welcome ada"));
    assert_eq!(sent[0].args["channel_id"], json!("mod-log"));
}

#[tokio::test]
async fn normalization_is_idempotent_for_full_documents() {
    let yaml = r#"
commands:
  echo:
    actions:
      - reply: {content: "${args.text}"}
events:
  message_create:
    - flow_if:
        if: "content | length > 100"
        then: [{delete_message: {}}]
automod:
  rules:
    wall-of-text:
      trigger: {type: newline_spam, threshold: 5}
      actions: [{delete_message: {}}]
"#;
    let mut tree: Value = serde_yaml::from_str(yaml).unwrap();
    weft::engine::normalize::normalize_document(&mut tree).unwrap();
    let once = tree.clone();
    weft::engine::normalize::normalize_document(&mut tree).unwrap();
    assert_eq!(tree, once);
}

#[tokio::test]
async fn unknown_verbs_fail_at_execute_not_load() {
    let (engine, client) = engine_from(
        r#"
commands:
  - name: odd
    actions:
      - definitely_not_a_verb: {x: 1}
      - reply: {content: "still ran"}
"#,
    )
    .await;
    engine.handle_command("odd", None, json!({}), interaction("i9")).await;
    // The unknown verb fails, the sequence continues, the reply lands.
    assert!(reply_contents(&client).contains(&"still ran".to_string()));
}
