// ── Weft Atoms: Constants ──────────────────────────────────────────────────
// All named engine-wide constants live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Flow engine caps ───────────────────────────────────────────────────────
// A flow that calls itself recurses through `call_flow`; the depth cap bounds
// the stack. The iteration cap bounds `repeat` / `flow_while` loops that the
// spec author got wrong. Both are overridable through the spec's `engine:`
// block — these are the defaults.
pub const DEFAULT_MAX_FLOW_DEPTH: usize = 10;
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000;

// ── Cron scheduler ─────────────────────────────────────────────────────────
// Next-run search walks forward minute by minute; one year is the horizon
// before giving up and falling back to now + 1h.
pub const CRON_SEARCH_LIMIT_MINUTES: u32 = 525_600;
// A `a,b,c` / `n-m` field expansion larger than this is rejected outright
// (defense against `0-99999`).
pub const CRON_MAX_LIST_SIZE: usize = 100;
// Tick interval for the scheduler loop.
pub const SCHEDULER_TICK_SECS: u64 = 60;

// ── Expression safety ──────────────────────────────────────────────────────
// Runtime-compiled patterns longer than this are rejected before compilation.
pub const MAX_PATTERN_LENGTH: usize = 500;
// Interpolation recursion / json-transform traversal depth bound. serde_json
// values cannot be cyclic, so this doubles as the "[Circular]" marker trigger
// for adversarially deep inputs.
pub const MAX_JSON_DEPTH: usize = 128;

// ── Automod defaults ───────────────────────────────────────────────────────
pub const DEFAULT_CAPS_THRESHOLD: f64 = 70.0;
pub const DEFAULT_EMOJI_THRESHOLD: usize = 10;
pub const DEFAULT_MENTION_THRESHOLD: usize = 5;
pub const DEFAULT_NEWLINE_THRESHOLD: usize = 10;

// ── Voice ──────────────────────────────────────────────────────────────────
pub const VOICE_VOLUME_MAX: u32 = 200;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;

// ── Platform limits ────────────────────────────────────────────────────────
// Discord caps a message at 2000 characters; we split slightly below that so
// the continuation marker fits.
pub const MESSAGE_SPLIT_LIMIT: usize = 1_950;

// ── Readiness timeouts ─────────────────────────────────────────────────────
// Gateway identify → READY, and voice join → connection ready.
pub const READY_TIMEOUT_SECS: u64 = 30;
