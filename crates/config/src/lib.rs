//! Configuration for the memobase core.
//!
//! A single [`Config`] value is constructed once and passed explicitly to
//! every entry point — there is no process-global state here. See
//! `SPEC_FULL.md` §6 for the option table this mirrors.

mod error;
mod topics;

pub use error::ConfigError;
pub use topics::{ProfileTopicConfig, SubTopicConfig, TopicConfig};

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Selects the adapter used by the LLM gateway (`C5`).
///
/// A fixed variant set rather than a free-form string key — the source
/// system dispatches on a runtime string (`llm_style`); here that becomes an
/// enum so an unknown style is a `ConfigError` at construction time instead
/// of a silent no-op at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmStyle {
    /// Plain OpenAI-compatible chat completions endpoint.
    OpenAiCompatible,
    /// Same wire format, but requests prompt caching where the provider
    /// supports it (e.g. an `Anthropic-style` or `OpenAI`-style cache_control
    /// hint). Routing, not semantics, differs from `OpenAiCompatible`.
    PromptCaching,
}

impl Default for LlmStyle {
    fn default() -> Self {
        Self::OpenAiCompatible
    }
}

impl std::str::FromStr for LlmStyle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai_compatible" => Ok(Self::OpenAiCompatible),
            "prompt_caching" | "cached" => Ok(Self::PromptCaching),
            other => Err(ConfigError::UnknownLlmStyle(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub llm_style: LlmStyle,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub best_llm_model: String,
    pub thinking_llm_model: String,
    pub summary_llm_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_style: LlmStyle::default(),
            llm_api_key: String::new(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            best_llm_model: "gpt-4o-mini".to_string(),
            thinking_llm_model: "gpt-4o-mini".to_string(),
            summary_llm_model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub embedding_provider: String,
    pub embedding_api_key: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    /// When false, C3's `search_gists` refuses with `NotImplemented` rather
    /// than falling back to a non-vector search.
    pub enable_event_embedding: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            embedding_provider: "openai".to_string(),
            embedding_api_key: String::new(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dim: 1536,
            enable_event_embedding: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Flush trigger: summed idle `token_size` that first exceeds this
    /// crosses the threshold (§4.4 `flush_candidates`).
    pub max_chat_blob_buffer_token_size: usize,
    /// Per-batch ceiling a flush is split on (§4.6 stage 1).
    pub max_chat_blob_buffer_process_token_size: usize,
    /// Idle entries older than this are flushed regardless of size.
    pub max_buffer_age_secs: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_chat_blob_buffer_token_size: 1024,
            max_chat_blob_buffer_process_token_size: 4096,
            max_buffer_age_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileRulesConfig {
    /// Reject facts whose topic isn't in the configured taxonomy instead of
    /// keeping them under a fallback topic.
    pub profile_strict_mode: bool,
    /// Require a second LLM confirmation call before a merge decision may
    /// delete a profile row (§4.6 stage 4, §9 Open Question 4).
    pub profile_validate_mode: bool,
    pub max_profile_subtopics: usize,
}

impl Default for ProfileRulesConfig {
    fn default() -> Self {
        Self {
            profile_strict_mode: false,
            profile_validate_mode: false,
            max_profile_subtopics: 20,
        }
    }
}

/// Defaults for retrieval/context-assembly call-site overrides (§4.7, §4.8).
/// Every field here is also accepted as an explicit override argument on the
/// façade's retrieval verbs; these are just the values used when a caller
/// doesn't override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_token_size: usize,
    pub time_range_in_days: i64,
    pub event_similarity_threshold: f32,
    /// Hard fraction of `max_token_size` reserved for profiles; unused
    /// budget donates to events (§9 Open Question 3).
    pub profile_event_ratio: f32,
    pub max_previous_chats: usize,
    pub full_profile_and_only_search_event: bool,
    pub fill_window_with_events: bool,
    pub require_event_summary: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_token_size: 2000,
            time_range_in_days: 30,
            event_similarity_threshold: 0.2,
            profile_event_ratio: 0.6,
            max_previous_chats: 6,
            full_profile_and_only_search_event: false,
            fill_window_with_events: false,
            require_event_summary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Selects prompt templates and the default taxonomy localization.
    pub language: String,
    /// Timestamp rendering in prompts only — never affects storage.
    pub use_timezone: String,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub buffer: BufferConfig,
    pub profile: ProfileRulesConfig,
    pub retrieval: RetrievalConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits. Missing file is not an error — matches the teacher's
    /// `AppConfig::load_from`, which treats "no config file yet" as the
    /// common case rather than a failure.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let mut config = Self::default();
        match fs::read_to_string(path_ref) {
            Ok(raw) => {
                config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path_ref.display().to_string(),
                    source,
                })?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path_ref.display().to_string(),
                    source,
                });
            }
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `MEMOBASE_*` environment variable overrides. Only credentials
    /// and endpoints are override-able this way — structural settings
    /// (taxonomy, budgets) are config-file-only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MEMOBASE_LLM_API_KEY") {
            if !v.is_empty() {
                self.llm.llm_api_key = v;
            }
        }
        if let Ok(v) = env::var("MEMOBASE_LLM_BASE_URL") {
            if !v.is_empty() {
                self.llm.llm_base_url = v;
            }
        }
        if let Ok(v) = env::var("MEMOBASE_EMBEDDING_API_KEY") {
            if !v.is_empty() {
                self.embedding.embedding_api_key = v;
            }
        }
        if let Ok(v) = env::var("MEMOBASE_EMBEDDING_BASE_URL") {
            if !v.is_empty() {
                self.embedding.embedding_base_url = v;
            }
        }
    }

    /// Raised at façade construction, never at call time (§7 `ConfigError`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.enable_event_embedding && self.llm.llm_api_key.is_empty() {
            return Err(ConfigError::MissingCredential("llm_api_key"));
        }
        if self.retrieval.profile_event_ratio < 0.0 || self.retrieval.profile_event_ratio > 1.0 {
            return Err(ConfigError::InvalidTopicConfig(
                "profile_event_ratio must be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: path_ref.display().to_string(),
                source,
            })?;
        }
        let rendered = toml::to_string_pretty(self).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
        })?;
        fs::write(path_ref, rendered).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert!(config.retrieval.profile_event_ratio <= 1.0);
        assert_eq!(config.llm.llm_style, LlmStyle::OpenAiCompatible);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from("/nonexistent/path/does-not-exist.toml").unwrap();
        assert_eq!(config.language, "");
    }

    #[test]
    fn validate_rejects_missing_credential_when_embeddings_enabled() {
        let mut config = Config::default();
        config.embedding.enable_event_embedding = true;
        config.llm.llm_api_key.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let mut config = Config::default();
        config.llm.llm_api_key = "key".to_string();
        config.retrieval.profile_event_ratio = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopicConfig(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.llm.llm_api_key = "test-key".to_string();
        config.language = "zh".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.llm.llm_api_key, "test-key");
        assert_eq!(loaded.language, "zh");
    }

    #[test]
    fn llm_style_from_str_rejects_unknown() {
        let result: Result<LlmStyle, _> = "made_up_style".parse();
        assert!(matches!(result, Err(ConfigError::UnknownLlmStyle(_))));
    }
}
