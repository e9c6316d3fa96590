// Weft — declarative chat-bot runtime.
// The engine turns a YAML spec into live behavior: commands, event handlers,
// named flows, cron jobs, automod rules, persistent state, and voice
// playback, all interpreted against an abstract platform client.

// ── Weft Atoms (constants, error types) ────────────────────────────────────
pub mod atoms;

// ── Weft Engine ────────────────────────────────────────────────────────────
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use engine::runtime::Engine;
pub use engine::spec::{parse_spec, SpecDocument};
