//! Retrieval and context assembly (C7, spec §4.7): four independent stages
//! — profile candidates, optional LLM filter, event search, optional
//! gap-fill — rendered into the fixed `# Memory` wire template.
//!
//! Stage 1 is the only stage that can fail the whole call; a failure in
//! stages 2-4 degrades that stage to an empty contribution instead.

use std::collections::HashMap;
use std::sync::Arc;

use memobase_config::{Config, RetrievalConfig};
use memobase_llm::{CompleteRequest, EmbedPhase};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::blob::{ChatMessage, Tokenizer};
use crate::error::CoreError;
use crate::event_store::EventStore;
use crate::llm_port::LlmPort;
use crate::profile_store::ProfileStore;
use crate::schema::{EventGist, ProfileEntry};

/// Per-call overrides layered over [`RetrievalConfig`] (spec §4.7, §6). Every
/// field mirrors a façade call-site argument; `None` means "use the config
/// default".
#[derive(Debug, Clone, Default)]
pub struct RetrievalOverrides {
    pub only_topics: Option<Vec<String>>,
    pub prefer_topics: Option<Vec<String>>,
    pub topic_limits: Option<HashMap<String, usize>>,
    pub max_subtopic_size: Option<usize>,
    pub max_token_size: Option<usize>,
    pub time_range_in_days: Option<i64>,
    pub event_similarity_threshold: Option<f32>,
    pub profile_event_ratio: Option<f32>,
    pub max_previous_chats: Option<usize>,
    pub full_profile_and_only_search_event: Option<bool>,
    pub fill_window_with_events: Option<bool>,
}

/// A [`RetrievalConfig`] with this call's overrides already resolved.
struct ResolvedRetrieval {
    max_token_size: usize,
    time_range_in_days: i64,
    event_similarity_threshold: f32,
    profile_event_ratio: f32,
    max_previous_chats: usize,
    full_profile_and_only_search_event: bool,
    fill_window_with_events: bool,
}

impl RetrievalOverrides {
    fn resolve(&self, base: &RetrievalConfig) -> ResolvedRetrieval {
        ResolvedRetrieval {
            max_token_size: self.max_token_size.unwrap_or(base.max_token_size),
            time_range_in_days: self.time_range_in_days.unwrap_or(base.time_range_in_days),
            event_similarity_threshold: self
                .event_similarity_threshold
                .unwrap_or(base.event_similarity_threshold),
            profile_event_ratio: self.profile_event_ratio.unwrap_or(base.profile_event_ratio),
            max_previous_chats: self.max_previous_chats.unwrap_or(base.max_previous_chats),
            full_profile_and_only_search_event: self
                .full_profile_and_only_search_event
                .unwrap_or(base.full_profile_and_only_search_event),
            fill_window_with_events: self
                .fill_window_with_events
                .unwrap_or(base.fill_window_with_events),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileFilterResponse {
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
    #[serde(default)]
    profiles: Vec<String>,
}

pub struct RetrievalAssembler {
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn EventStore>,
    llm: Arc<dyn LlmPort>,
    tokenizer: Arc<Tokenizer>,
    config: Config,
}

impl RetrievalAssembler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventStore>,
        llm: Arc<dyn LlmPort>,
        tokenizer: Arc<Tokenizer>,
        config: Config,
    ) -> Self {
        Self {
            profiles,
            events,
            llm,
            tokenizer,
            config,
        }
    }

    /// Stages 1-2: the filtered profile candidate set, without event search
    /// or rendering. This is what `get_relevant_profiles` exposes directly.
    pub async fn relevant_profiles(
        &self,
        user_id: &str,
        tail: &[ChatMessage],
        overrides: &RetrievalOverrides,
    ) -> Result<Vec<ProfileEntry>, CoreError> {
        let resolved = overrides.resolve(&self.config.retrieval);
        let rows = self.profiles.list(user_id, None).await?;
        let profile_budget = (resolved.max_token_size as f32 * resolved.profile_event_ratio) as usize;
        let (candidates, _used_tokens) = self.candidate_profiles(rows, overrides, profile_budget);
        Ok(self.llm_filter_profiles(candidates, tail, &resolved).await)
    }

    /// Stages 1-5: the full rendered context string, at most
    /// `resolved.max_token_size` tokens.
    pub async fn conversation_context(
        &self,
        user_id: &str,
        tail: &[ChatMessage],
        overrides: &RetrievalOverrides,
    ) -> Result<String, CoreError> {
        let resolved = overrides.resolve(&self.config.retrieval);
        if resolved.max_token_size == 0 {
            return Ok(String::new());
        }

        let rows = self.profiles.list(user_id, None).await?;
        let profile_budget = (resolved.max_token_size as f32 * resolved.profile_event_ratio) as usize;
        let (candidates, used_profile_tokens) = self.candidate_profiles(rows, overrides, profile_budget);
        let filtered = self.llm_filter_profiles(candidates, tail, &resolved).await;

        let event_budget = resolved.max_token_size.saturating_sub(used_profile_tokens);
        let (gists, used_event_tokens) = self.search_events(user_id, tail, event_budget, &resolved).await;
        let gists = self
            .gap_fill(user_id, gists, used_event_tokens, event_budget, &resolved)
            .await;

        Ok(self.render(&filtered, &gists, tail, resolved.max_token_size))
    }

    /// Stage 1: whitelist → preference reorder → per-topic/global caps →
    /// token-budget truncation. Returns the surviving rows plus the tokens
    /// their rendered bullet lines consumed.
    fn candidate_profiles(
        &self,
        mut rows: Vec<ProfileEntry>,
        overrides: &RetrievalOverrides,
        profile_budget: usize,
    ) -> (Vec<ProfileEntry>, usize) {
        if let Some(only_topics) = &overrides.only_topics {
            rows.retain(|r| only_topics.contains(&r.attributes.topic));
        }

        if let Some(prefer_topics) = &overrides.prefer_topics {
            let (preferred, rest): (Vec<_>, Vec<_>) =
                rows.into_iter().partition(|r| prefer_topics.contains(&r.attributes.topic));
            rows = preferred.into_iter().chain(rest).collect();
        }

        let mut per_topic_count: HashMap<String, usize> = HashMap::new();
        let mut seen_subtopics = 0usize;
        let max_subtopic_size = overrides.max_subtopic_size.unwrap_or(usize::MAX);
        rows.retain(|row| {
            if let Some(limits) = &overrides.topic_limits {
                if let Some(&limit) = limits.get(&row.attributes.topic) {
                    let count = per_topic_count.entry(row.attributes.topic.clone()).or_insert(0);
                    if *count >= limit {
                        return false;
                    }
                    *count += 1;
                }
            }
            if seen_subtopics >= max_subtopic_size {
                return false;
            }
            seen_subtopics += 1;
            true
        });

        let mut kept = Vec::new();
        let mut used_tokens = 0usize;
        for row in rows {
            let line = profile_line(&row);
            let line_tokens = self.tokenizer.count(&line);
            if used_tokens + line_tokens > profile_budget {
                break;
            }
            used_tokens += line_tokens;
            kept.push(row);
        }
        (kept, used_tokens)
    }

    /// Stage 2: optional LLM filter. Falls back to the unfiltered candidate
    /// set on any failure — never fails the whole retrieval.
    async fn llm_filter_profiles(
        &self,
        candidates: Vec<ProfileEntry>,
        tail: &[ChatMessage],
        resolved: &ResolvedRetrieval,
    ) -> Vec<ProfileEntry> {
        if resolved.full_profile_and_only_search_event || tail.is_empty() || candidates.is_empty() {
            return candidates;
        }

        match self.try_llm_filter_profiles(&candidates, tail, resolved).await {
            Ok(ids) => {
                let filtered: Vec<ProfileEntry> =
                    candidates.iter().filter(|c| ids.contains(&c.profile_id)).cloned().collect();
                if filtered.is_empty() {
                    candidates
                } else {
                    filtered
                }
            }
            Err(err) => {
                warn!(error = %err, "profile llm filter failed; falling back to unfiltered candidate set");
                candidates
            }
        }
    }

    async fn try_llm_filter_profiles(
        &self,
        candidates: &[ProfileEntry],
        tail: &[ChatMessage],
        resolved: &ResolvedRetrieval,
    ) -> Result<Vec<Uuid>, CoreError> {
        let recent: Vec<String> = tail
            .iter()
            .rev()
            .take(resolved.max_previous_chats)
            .map(|m| m.content.clone())
            .collect();
        let recent_block = recent.into_iter().rev().collect::<Vec<_>>().join("\n");

        let candidate_block = candidates
            .iter()
            .map(|c| format!("{}: {}::{}: {}", c.profile_id, c.attributes.topic, c.attributes.sub_topic, c.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Recent conversation:\n{recent_block}\n\nCandidate profile rows (id: topic::sub_topic: content):\n\
             {candidate_block}\n\nSelect only the rows relevant to the conversation. Respond with JSON: \
             {{\"reason\": str, \"profiles\": [id, ...]}}"
        );
        let request = CompleteRequest::new(self.config.llm.best_llm_model.clone(), prompt).json();
        let value = self.llm.complete_json(&request).await?;
        let parsed: ProfileFilterResponse = serde_json::from_value(value)
            .map_err(|err| CoreError::Unprocessable(format!("profile filter response: {err}")))?;
        Ok(parsed
            .profiles
            .into_iter()
            .filter_map(|id| Uuid::parse_str(&id).ok())
            .collect())
    }

    /// Stage 3: event search, degrading to an empty result on any failure.
    /// Returns the surviving gists plus the tokens they consumed.
    async fn search_events(
        &self,
        user_id: &str,
        tail: &[ChatMessage],
        event_budget: usize,
        resolved: &ResolvedRetrieval,
    ) -> (Vec<EventGist>, usize) {
        let query = pack_latest_chat(tail, 3);
        let gists = match self.try_search_events(user_id, &query, resolved).await {
            Ok(gists) => gists,
            Err(err) => {
                warn!(error = %err, "event search failed; past events section will be empty");
                Vec::new()
            }
        };
        truncate_event_gists(gists, event_budget, &self.tokenizer)
    }

    async fn try_search_events(
        &self,
        user_id: &str,
        query: &str,
        resolved: &ResolvedRetrieval,
    ) -> Result<Vec<EventGist>, CoreError> {
        if query.is_empty() {
            return Ok(self.events.recent_gists(user_id, 60, resolved.time_range_in_days).await?);
        }

        if self.config.embedding.enable_event_embedding {
            let query_embedding = self
                .llm
                .embed(&[query.to_string()], EmbedPhase::Query, &self.config.embedding.embedding_model)
                .await?;
            let query_embedding = query_embedding.into_iter().next().unwrap_or_default();
            let scored = self
                .events
                .search_gists(
                    user_id,
                    &query_embedding,
                    60,
                    resolved.event_similarity_threshold,
                    resolved.time_range_in_days,
                    true,
                )
                .await?;
            Ok(scored.into_iter().map(|(gist, _score)| gist).collect())
        } else {
            self.events.recent_gists(user_id, 60, resolved.time_range_in_days).await
        }
    }

    /// Stage 4: append older gists (by recency) until the residual budget is
    /// consumed, skipping ones already present.
    async fn gap_fill(
        &self,
        user_id: &str,
        mut gists: Vec<EventGist>,
        used_event_tokens: usize,
        event_budget: usize,
        resolved: &ResolvedRetrieval,
    ) -> Vec<EventGist> {
        if !resolved.fill_window_with_events || used_event_tokens >= event_budget {
            return gists;
        }

        let older = match self.events.recent_gists(user_id, 60, resolved.time_range_in_days).await {
            Ok(older) => older,
            Err(err) => {
                warn!(error = %err, "gap-fill event lookup failed; skipping");
                return gists;
            }
        };

        let seen: std::collections::HashSet<Uuid> = gists.iter().map(|g| g.gist_id).collect();
        let mut remaining_budget = event_budget.saturating_sub(used_event_tokens);
        for gist in older {
            if seen.contains(&gist.gist_id) {
                continue;
            }
            let tokens = self.tokenizer.count(&gist.content);
            if tokens > remaining_budget {
                break;
            }
            remaining_budget -= tokens;
            gists.push(gist);
        }
        gists
    }

    /// Stage 5: the fixed wire template (spec §4.7, §6 "Context wire
    /// format"). Section headers, the bullet-dash prefix, the
    /// `topic::sub_topic` separator, and the terminating `---` are stable.
    ///
    /// `profiles` and `gists` arrive pre-truncated to `profile_budget`/
    /// `event_budget`, but the scaffolding text and the live session `tail`
    /// are not accounted for anywhere upstream. To keep the §8 fixed-point
    /// property (this output, tokenized again, is ≤ `max_tokens`) we budget
    /// the tail against whatever room is left after the scaffolding and
    /// profile/event sections, then apply a final whole-string clamp as a
    /// backstop — the same role the original's crude `len(full_context) >
    /// max_tokens*4` check plays in `build_context`.
    fn render(&self, profiles: &[ProfileEntry], gists: &[EventGist], tail: &[ChatMessage], max_tokens: usize) -> String {
        let mut parts = Vec::new();
        parts.push("---".to_string());
        parts.push("# Memory".to_string());
        parts.push(
            "Unless the user has relevant queries, do not actively mention those memories in the conversation."
                .to_string(),
        );

        if !profiles.is_empty() {
            parts.push("## User Current Profile:".to_string());
            for profile in profiles {
                parts.push(profile_line(profile));
            }
        }

        if !gists.is_empty() {
            parts.push("\n## Past Events:".to_string());
            for gist in gists {
                parts.push(gist.content.clone());
            }
        }

        let header = parts.join("\n");
        let terminator = "\n---".to_string();
        let reserved = self.tokenizer.count(&header) + self.tokenizer.count(&terminator);
        let tail_budget = max_tokens.saturating_sub(reserved);

        let mut tail_section = String::new();
        if !tail.is_empty() && tail_budget > 0 {
            let mut tail_parts = vec!["\n## Current Session Context:".to_string()];
            for message in tail {
                tail_parts.push(format!("{:?}: {}", message.role, message.content));
            }
            let joined = tail_parts.join("\n");
            tail_section = if self.tokenizer.count(&joined) <= tail_budget {
                joined
            } else {
                self.tokenizer.truncate(&joined, tail_budget)
            };
        }

        let mut full = header;
        if !tail_section.is_empty() {
            full.push('\n');
            full.push_str(&tail_section);
        }
        full.push_str(&terminator);

        if self.tokenizer.count(&full) > max_tokens {
            full = self.tokenizer.truncate(&full, max_tokens);
        }
        full
    }
}

fn profile_line(row: &ProfileEntry) -> String {
    format!("- {}::{}: {}", row.attributes.topic, row.attributes.sub_topic, row.content)
}

/// The query built for event search (spec §4.7 step 3, supplemented from
/// `pack_latest_chat`): the last `n` tail messages' content, joined by `\n`.
pub fn pack_latest_chat(tail: &[ChatMessage], n: usize) -> String {
    let start = tail.len().saturating_sub(n);
    tail[start..].iter().map(|m| m.content.clone()).collect::<Vec<_>>().join("\n")
}

/// Strict "first overflow breaks" truncation (supplemented from
/// `truncate_event_gists`): sums `gist.content` tokens in order, stopping
/// before the first gist that would push the running total over `budget`.
fn truncate_event_gists(gists: Vec<EventGist>, budget: usize, tokenizer: &Tokenizer) -> (Vec<EventGist>, usize) {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for gist in gists {
        let tokens = tokenizer.count(&gist.content);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        kept.push(gist);
    }
    (kept, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MessageRole;
    use crate::event_store::InMemoryEventStore;
    use crate::profile_store::{InMemoryProfileStore, NewProfile};
    use crate::schema::ProfileAttributes;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopLlm;

    #[async_trait]
    impl LlmPort for NoopLlm {
        async fn complete_json(&self, _request: &CompleteRequest) -> Result<serde_json::Value, CoreError> {
            Ok(json!({"reason": "noop", "profiles": []}))
        }
        async fn complete_text(&self, _request: &CompleteRequest) -> Result<String, CoreError> {
            Ok(String::new())
        }
        async fn embed(&self, texts: &[String], _phase: EmbedPhase, _model: &str) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn assembler(config: Config) -> (RetrievalAssembler, Arc<InMemoryProfileStore>, Arc<InMemoryEventStore>) {
        let profiles = Arc::new(InMemoryProfileStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        let tokenizer = Arc::new(Tokenizer::new().unwrap());
        let a = RetrievalAssembler::new(
            profiles.clone(),
            events.clone(),
            Arc::new(NoopLlm),
            tokenizer,
            config,
        );
        (a, profiles, events)
    }

    fn base_config() -> Config {
        let mut config = Config::default();
        config.llm.llm_api_key = "test".to_string();
        config.embedding.embedding_api_key = "test".to_string();
        config.retrieval.full_profile_and_only_search_event = true; // skip LLM filter in most tests
        config
    }

    #[tokio::test]
    async fn max_token_size_zero_yields_empty_string() {
        let (assembler, _, _) = assembler(base_config());
        let overrides = RetrievalOverrides {
            max_token_size: Some(0),
            ..Default::default()
        };
        let context = assembler.conversation_context("u1", &[], &overrides).await.unwrap();
        assert_eq!(context, "");
    }

    #[tokio::test]
    async fn renders_profile_and_event_sections_within_budget() {
        let (assembler, profiles, events) = assembler(base_config());
        profiles
            .add(
                "u1",
                vec![NewProfile {
                    content: "plays jazz guitar".to_string(),
                    attributes: ProfileAttributes::new("hobbies", "music"),
                }],
            )
            .await
            .unwrap();
        let event_id = events.put_event("u1", json!({}), None).await.unwrap();
        events.put_gist("u1", event_id, "talked about jazz guitar".to_string(), None).await.unwrap();

        let context = assembler.conversation_context("u1", &[], &RetrievalOverrides::default()).await.unwrap();
        assert!(context.starts_with("---\n# Memory\n"));
        assert!(context.contains("## User Current Profile:"));
        assert!(context.contains("hobbies::music: plays jazz guitar"));
        assert!(context.ends_with("---"));
        let token_count = Tokenizer::new().unwrap().count(&context);
        assert!(token_count <= base_config().retrieval.max_token_size);
    }

    #[tokio::test]
    async fn rendered_context_never_exceeds_budget_with_long_tail() {
        let (assembler, profiles, events) = assembler(base_config());
        profiles
            .add(
                "u1",
                vec![NewProfile {
                    content: "plays jazz guitar".to_string(),
                    attributes: ProfileAttributes::new("hobbies", "music"),
                }],
            )
            .await
            .unwrap();
        let event_id = events.put_event("u1", json!({}), None).await.unwrap();
        events.put_gist("u1", event_id, "talked about jazz guitar".to_string(), None).await.unwrap();

        // A long, unbounded session tail — this is what the assembler used to
        // pass straight through `render` with no budget accounting.
        let tail: Vec<ChatMessage> = (0..200)
            .map(|i| ChatMessage::new(MessageRole::User, format!("message number {i} with some filler words")))
            .collect();

        let overrides = RetrievalOverrides { max_token_size: Some(64), ..Default::default() };
        let context = assembler.conversation_context("u1", &tail, &overrides).await.unwrap();
        let token_count = Tokenizer::new().unwrap().count(&context);
        assert!(token_count <= 64, "rendered context of {token_count} tokens exceeds the 64 token budget");
    }

    #[tokio::test]
    async fn only_topics_whitelist_drops_other_topics() {
        let (assembler, profiles, _events) = assembler(base_config());
        profiles
            .add(
                "u1",
                vec![
                    NewProfile { content: "a".to_string(), attributes: ProfileAttributes::new("hobbies", "music") },
                    NewProfile { content: "b".to_string(), attributes: ProfileAttributes::new("career", "goals") },
                ],
            )
            .await
            .unwrap();

        let overrides = RetrievalOverrides {
            only_topics: Some(vec!["hobbies".to_string()]),
            ..Default::default()
        };
        let rows = assembler.relevant_profiles("u1", &[], &overrides).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributes.topic, "hobbies");
    }

    #[tokio::test]
    async fn pack_latest_chat_joins_last_n_messages() {
        let tail = vec![
            ChatMessage::new(MessageRole::User, "one"),
            ChatMessage::new(MessageRole::Assistant, "two"),
            ChatMessage::new(MessageRole::User, "three"),
            ChatMessage::new(MessageRole::Assistant, "four"),
        ];
        assert_eq!(pack_latest_chat(&tail, 3), "two\nthree\nfour");
    }

    #[tokio::test]
    async fn no_embeddings_falls_back_to_recent_gists() {
        let mut config = base_config();
        config.embedding.enable_event_embedding = false;
        let (assembler, _profiles, events) = assembler(config);
        let event_id = events.put_event("u1", json!({}), None).await.unwrap();
        events.put_gist("u1", event_id, "a gist".to_string(), None).await.unwrap();

        let tail = vec![ChatMessage::new(MessageRole::User, "tell me about my hobbies")];
        let context = assembler.conversation_context("u1", &tail, &RetrievalOverrides::default()).await.unwrap();
        assert!(context.contains("a gist"));
    }
}
