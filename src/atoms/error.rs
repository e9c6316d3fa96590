// ── Weft Atoms: Error Types ────────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (normalization, flow, expression,
//     storage, platform I/O…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `EngineError` → `String` conversion is provided via `Display` so action
//     results can carry the message without keeping the error alive.
//   • No variant carries secret material (bot tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML spec document failed to parse.
    #[error("Spec parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Spec tree malformed — an action without a verb, a mapping where a
    /// sequence was required, or an unknown verb reaching the executor.
    /// Fatal at load, a failed action result at execute time.
    #[error("Normalization error: {0}")]
    Normalization(String),

    /// `call_flow` referenced a flow that is not registered.
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow recursion exceeded the configured depth cap.
    #[error("Maximum flow depth {0} exceeded")]
    MaxFlowDepth(usize),

    /// A flow was aborted via the `abort` action. Carried on the flow result;
    /// does not propagate past the nearest enclosing frame unless re-aborted.
    #[error("Flow aborted{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    FlowAborted { reason: Option<String> },

    /// Flow parameter missing, or its value does not match the declared type.
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// Expression parse or evaluation failure.
    #[error("Expression error: {0}")]
    Expression(String),

    /// Unique / primary-key violation from the storage layer.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Storage or platform I/O failed in a retryable way.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Gateway or voice connection did not become ready in time.
    #[error("Ready timeout: {0}")]
    ReadyTimeout(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a normalization error.
    pub fn normalization(message: impl Into<String>) -> Self {
        Self::Normalization(message.into())
    }

    /// Create an expression error.
    pub fn expression(message: impl Into<String>) -> Self {
        Self::Expression(message.into())
    }

    /// Create a parameter error.
    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter(message.into())
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True when this error is the abort marker (checked by enclosing flows).
    pub fn is_abort(&self) -> bool {
        matches!(self, EngineError::FlowAborted { .. })
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers still returning `Result<T, String>` inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────
// Lets action results store the message with `.map_err(EngineError::into)`.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
