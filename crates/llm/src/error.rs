use thiserror::Error;

/// Failures surfaced by the LLM/embedding gateway (spec §7).
///
/// Deliberately coarse: callers branch on the variant, not on transport
/// detail, so a provider swap never changes call-site error handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The provider could not be reached, or returned a transient failure
    /// (timeout, 5xx, connection reset). Safe to retry later.
    #[error("llm provider unavailable: {0}")]
    ServiceUnavailable(String),

    /// The provider responded but the content couldn't be turned into the
    /// shape the caller asked for — including the case where a JSON-mode
    /// request came back malformed twice in a row (request, then one
    /// reformat retry).
    #[error("could not extract a usable response from the provider: {0}")]
    Unprocessable(String),

    /// The provider rejected the request outright: bad credentials, bad
    /// model name, bad request shape. Not worth retrying without a config
    /// change.
    #[error("llm provider rejected the request: {0}")]
    Rejected(String),
}
