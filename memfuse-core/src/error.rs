//! Error types for the MemFuse core engine.

use uuid::Uuid;

/// Result type alias for MemFuse operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the core engine, following the propagation policy in
/// the error handling design: transient external errors are retried,
/// validation errors get one repair attempt, constraint violations are
/// absorbed as no-ops, and logic invariants are fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage backend failure (connection, query, pool exhaustion).
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedder call failed (transient, retried with backoff).
    #[error("embedder error: {0}")]
    Embedder(String),

    /// Language model call failed (transient, retried with backoff).
    #[error("language model error: {0}")]
    LanguageModel(String),

    /// Structured-JSON completion didn't validate against its schema, even
    /// after one repair pass.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// A plan referenced an unknown subagent, or a step's params failed
    /// validation, after one repair attempt.
    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    /// A subagent step failed after exhausting its repair retries.
    #[error("step execution failed: {0}")]
    StepExecution(String),

    /// Requested entity was not found.
    #[error("not found: {0}")]
    NotFound(Uuid),

    /// Input failed a structural or semantic validation check.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine reached a state an invariant says is unreachable
    /// (unknown agent name, negative round_id, missing embedding). Never
    /// user-visible beyond a generic failure.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Token or connection-pool budget exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Request deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration value was missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO failure (durable queue marker, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the "transient external" class the
    /// retry policy should retry with exponential backoff.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Embedder(_) | Error::LanguageModel(_) | Error::Io(_)
        )
    }

    /// Whether this error is a dedup/idempotency no-op that should be
    /// absorbed silently rather than surfaced.
    #[must_use]
    pub fn is_constraint_absorbed(&self) -> bool {
        matches!(self, Error::InvalidInput(msg) if msg.starts_with("duplicate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_recoverable() {
        assert!(Error::Storage("timeout".into()).is_recoverable());
        assert!(Error::Embedder("5xx".into()).is_recoverable());
        assert!(Error::LanguageModel("rate limited".into()).is_recoverable());
    }

    #[test]
    fn invariant_errors_are_not_recoverable() {
        assert!(!Error::Invariant("unknown agent".into()).is_recoverable());
        assert!(!Error::PlanValidation("bad params".into()).is_recoverable());
    }

    #[test]
    fn not_found_displays_uuid() {
        let id = Uuid::nil();
        let err = Error::NotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
