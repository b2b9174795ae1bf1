use thiserror::Error;

/// Configuration-layer failures.
///
/// Raised at façade construction or first use; never recoverable in-band —
/// callers are expected to fix the configuration and restart, not retry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("unknown llm_style: {0:?}")]
    UnknownLlmStyle(String),

    #[error("embedding_dim {configured} does not match the deployed index dimension {deployed}")]
    EmbeddingDimMismatch { configured: usize, deployed: usize },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid profile topic configuration: {0}")]
    InvalidTopicConfig(String),
}
