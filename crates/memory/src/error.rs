use thiserror::Error;

/// The core's typed error taxonomy (spec §7).
///
/// Every fallible operation in this crate returns `Result<_, CoreError>`.
/// Callers match on the variant, not on a string — `ServiceUnavailable` is
/// worth retrying, `NotImplemented` never is, and so on.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing credential, dimension mismatch, unknown `llm_style`. Raised
    /// at façade construction or first use.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient LLM/embedding/storage failure.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Malformed JSON from the LLM after one reformat attempt. Fatal for
    /// the current batch only.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// e.g. vector search with embeddings disabled. Always surfaced, never
    /// retried.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Storage read of a missing row, surfaced only where the spec says a
    /// miss is an error rather than an empty result or a silent skip.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation: duplicate `(topic, sub_topic)`, negative token
    /// size. Fatal; the message should carry enough state to diagnose.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<memobase_llm::GatewayError> for CoreError {
    fn from(err: memobase_llm::GatewayError) -> Self {
        match err {
            memobase_llm::GatewayError::ServiceUnavailable(msg) => CoreError::ServiceUnavailable(msg),
            memobase_llm::GatewayError::Unprocessable(msg) => CoreError::Unprocessable(msg),
            memobase_llm::GatewayError::Rejected(msg) => CoreError::Config(msg),
        }
    }
}
