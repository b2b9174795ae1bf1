//! The profile taxonomy (`ProfileTopicConfig`, spec §3): the set of topics
//! and sub-topics extraction is allowed to file facts under.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTopicConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl SubTopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default)]
    pub description: Option<String>,
    pub sub_topics: Vec<SubTopicConfig>,
}

/// Built-in taxonomy, plus an optional user override.
///
/// `overwrite_topics` replaces the built-in set entirely; `additional_topics`
/// appends to it. Exactly one of the two should be set by a caller — if both
/// are, `overwrite_topics` wins, matching
/// `read_out_profile_config` in the original implementation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileTopicConfig {
    #[serde(default)]
    pub overwrite_topics: Option<Vec<TopicConfig>>,
    #[serde(default)]
    pub additional_topics: Option<Vec<TopicConfig>>,
    /// Topic new facts fall under when `profile_strict_mode` is off and the
    /// extracted topic isn't in the resolved taxonomy.
    #[serde(default = "default_fallback_topic")]
    pub fallback_topic: String,
}

fn default_fallback_topic() -> String {
    "other".to_string()
}

impl ProfileTopicConfig {
    /// Resolve the effective taxonomy: overwrite wins over additional, which
    /// wins over the built-in default set.
    pub fn resolve(&self) -> Vec<TopicConfig> {
        if let Some(overwrite) = &self.overwrite_topics {
            return overwrite.clone();
        }
        if let Some(additional) = &self.additional_topics {
            let mut resolved = default_topics();
            resolved.extend(additional.clone());
            return resolved;
        }
        default_topics()
    }

    /// `true` if `topic` belongs to the resolved taxonomy.
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.resolve().iter().any(|t| t.topic == topic)
    }

    /// Sub-topics configured for `topic`, or an empty slice if the topic is
    /// unknown or carries no sub-topic declarations.
    pub fn sub_topics_for(&self, topic: &str) -> Vec<String> {
        self.resolve()
            .into_iter()
            .find(|t| t.topic == topic)
            .map(|t| t.sub_topics.into_iter().map(|s| s.name).collect())
            .unwrap_or_default()
    }
}

/// The built-in taxonomy shipped with the system.
fn default_topics() -> Vec<TopicConfig> {
    vec![
        TopicConfig {
            topic: "basic_info".to_string(),
            description: Some("Stable facts about who the user is".to_string()),
            sub_topics: vec![
                SubTopicConfig::new("name"),
                SubTopicConfig::new("location"),
                SubTopicConfig::new("occupation"),
            ],
        },
        TopicConfig {
            topic: "hobbies".to_string(),
            description: Some("Recreational interests and activities".to_string()),
            sub_topics: vec![SubTopicConfig::new("music"), SubTopicConfig::new("sports")],
        },
        TopicConfig {
            topic: "career".to_string(),
            description: Some("Work, projects, professional goals".to_string()),
            sub_topics: vec![
                SubTopicConfig::new("current_role"),
                SubTopicConfig::new("goals"),
            ],
        },
        TopicConfig {
            topic: "preferences".to_string(),
            description: Some("Likes, dislikes, communication style".to_string()),
            sub_topics: vec![SubTopicConfig::new("general")],
        },
        TopicConfig {
            topic: "relationships".to_string(),
            description: Some("People the user mentions recurringly".to_string()),
            sub_topics: vec![SubTopicConfig::new("family"), SubTopicConfig::new("friends")],
        },
        TopicConfig {
            topic: "other".to_string(),
            description: Some("Fallback topic for unclassified facts".to_string()),
            sub_topics: vec![SubTopicConfig::new("general")],
        },
    ]
}
