//! The façade (C8, spec §4.8): binds a [`Config`] and the storage/LLM
//! collaborators into the small verb set integrators actually call.

use std::collections::HashMap;
use std::sync::Arc;

use memobase_config::{Config, ProfileTopicConfig};
use memobase_llm::Gateway;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::{Blob, BlobType, ChatMessage, MessageRole, Tokenizer};
use crate::buffer::{BlobStore, BufferManager, InMemoryBlobStore};
use crate::error::CoreError;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::extraction::{ExtractionPipeline, ExtractionResult};
use crate::llm_port::LlmPort;
use crate::profile_store::{InMemoryProfileStore, ProfileStore};
use crate::retrieval::{RetrievalAssembler, RetrievalOverrides};
use crate::schema::{EventGist, ProfileEntry};

/// One profile row inside a grouped [`Profile`] view — [`ProfileEntry`]
/// minus the `(topic, sub_topic)` pair, which is already the map's key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntryView {
    pub profile_id: Uuid,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&ProfileEntry> for ProfileEntryView {
    fn from(row: &ProfileEntry) -> Self {
        Self {
            profile_id: row.profile_id,
            content: row.content.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// `{topic, subtopics: Map<sub_topic, ProfileEntry>}` (supplemented from
/// `main.py`'s `get_user_profiles`/`get_relevant_profiles`): the façade's
/// external response shape, grouped by topic. Distinct from C2's flat
/// [`ProfileEntry`] storage rows — this view never touches storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub topic: String,
    pub subtopics: HashMap<String, ProfileEntryView>,
}

/// Groups flat rows by topic, preserving the order topics are first seen in
/// `rows` (which `ProfileStore::list` returns newest-updated first).
fn group_profiles(rows: &[ProfileEntry]) -> Vec<Profile> {
    let mut order: Vec<String> = Vec::new();
    let mut by_topic: HashMap<String, HashMap<String, ProfileEntryView>> = HashMap::new();
    for row in rows {
        let topic = &row.attributes.topic;
        if !by_topic.contains_key(topic) {
            order.push(topic.clone());
        }
        by_topic
            .entry(topic.clone())
            .or_default()
            .insert(row.attributes.sub_topic.clone(), row.into());
    }
    order
        .into_iter()
        .map(|topic| Profile {
            subtopics: by_topic.remove(&topic).unwrap_or_default(),
            topic,
        })
        .collect()
}

/// The three blob lanes a buffer flush check runs over. `BlobType` doesn't
/// derive `Hash` (it mirrors the wire enum as-is), so this is a fixed array
/// rather than a set — checking an empty lane's flush candidates is cheap.
const BLOB_TYPES: [BlobType; 3] = [BlobType::Chat, BlobType::Doc, BlobType::Code];

/// Binds [`Config`] plus the storage/LLM collaborators (spec §1, §4.8).
/// Constructed once per deployment and passed explicitly — there is no
/// process-global state here, matching the config crate's own convention.
pub struct Memobase {
    config: Config,
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn EventStore>,
    llm: Arc<dyn LlmPort>,
    buffer: BufferManager,
    tokenizer: Arc<Tokenizer>,
    extraction: ExtractionPipeline,
    retrieval: RetrievalAssembler,
}

impl Memobase {
    /// Wires up the reference in-memory stores and a [`Gateway`] built from
    /// `config`. Fine for tests and single-process deployments; production
    /// deployments needing a real wide-table/vector store should use
    /// [`Memobase::with_stores`] instead.
    pub fn new(config: Config) -> Result<Self, CoreError> {
        config.validate().map_err(|err| CoreError::Config(err.to_string()))?;
        let llm: Arc<dyn LlmPort> = Arc::new(Gateway::new(&config));
        Self::with_stores(
            config,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(InMemoryEventStore::new()),
            Box::new(InMemoryBlobStore::new()),
            llm,
        )
    }

    pub fn with_stores(
        config: Config,
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventStore>,
        blobs: Box<dyn BlobStore>,
        llm: Arc<dyn LlmPort>,
    ) -> Result<Self, CoreError> {
        config.validate().map_err(|err| CoreError::Config(err.to_string()))?;
        let tokenizer = Arc::new(Tokenizer::new()?);
        let extraction = ExtractionPipeline::new(
            profiles.clone(),
            events.clone(),
            llm.clone(),
            tokenizer.clone(),
            config.clone(),
        );
        let retrieval = RetrievalAssembler::new(
            profiles.clone(),
            events.clone(),
            llm.clone(),
            tokenizer.clone(),
            config.clone(),
        );
        Ok(Self {
            config,
            profiles,
            events,
            llm,
            buffer: BufferManager::new(blobs),
            tokenizer,
            extraction,
            retrieval,
        })
    }

    /// Buffers `blobs`, then flushes any blob-type lane that has crossed its
    /// threshold (spec §4.4, §4.6). Lanes left idle contribute nothing to
    /// the returned result — `extract_memories` never blocks on a lane that
    /// hasn't reached its trigger.
    pub async fn extract_memories(
        &self,
        user_id: &str,
        blobs: Vec<Blob>,
        profile_config: Option<ProfileTopicConfig>,
    ) -> Result<ExtractionResult, CoreError> {
        let profile_config = profile_config.unwrap_or_default();
        for blob in blobs {
            self.buffer.insert(user_id, blob, &self.tokenizer).await?;
        }

        let mut results = Vec::new();
        for blob_type in BLOB_TYPES {
            let candidates = self.buffer.flush_candidates(user_id, blob_type, &self.config.buffer);
            if candidates.is_empty() {
                continue;
            }
            let result = self
                .buffer
                .flush(user_id, blob_type, &candidates, &profile_config, &self.extraction)
                .await?;
            results.push(result);
        }
        Ok(ExtractionResult::merge(results))
    }

    /// All profile rows for `user_id`, grouped by topic. `topics: Some(_)`
    /// restricts the result to those topics.
    pub async fn get_user_profiles(
        &self,
        user_id: &str,
        topics: Option<&[String]>,
    ) -> Result<Vec<Profile>, CoreError> {
        let mut rows = self.profiles.list(user_id, None).await?;
        if let Some(topics) = topics {
            rows.retain(|r| topics.contains(&r.attributes.topic));
        }
        Ok(group_profiles(&rows))
    }

    /// The most recent event gists for `user_id`, newest first.
    pub async fn get_events(
        &self,
        user_id: &str,
        window_days: i64,
        limit: usize,
    ) -> Result<Vec<EventGist>, CoreError> {
        self.events.recent_gists(user_id, limit, window_days).await
    }

    /// Similarity search over `user_id`'s event gists. Surfaces
    /// `CoreError::NotImplemented` unchanged when embeddings are disabled —
    /// unlike the context assembler, a direct search call never silently
    /// degrades to a non-vector fallback (spec §7).
    pub async fn search_events(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        threshold: f32,
        window_days: i64,
    ) -> Result<Vec<(EventGist, f32)>, CoreError> {
        if !self.config.embedding.enable_event_embedding {
            return self
                .events
                .search_gists(user_id, &[], limit, threshold, window_days, false)
                .await;
        }
        let embeddings = self
            .llm
            .embed(
                &[query.to_string()],
                memobase_llm::EmbedPhase::Query,
                &self.config.embedding.embedding_model,
            )
            .await?;
        let query_embedding = embeddings.into_iter().next().unwrap_or_default();
        self.events
            .search_gists(user_id, &query_embedding, limit, threshold, window_days, true)
            .await
    }

    /// Stages 1-2 of retrieval (spec §4.7): the profile candidate set after
    /// whitelist/preference/budget filtering and the optional LLM filter,
    /// grouped by topic.
    pub async fn get_relevant_profiles(
        &self,
        user_id: &str,
        conversation: &[ChatMessage],
        overrides: &RetrievalOverrides,
    ) -> Result<Vec<Profile>, CoreError> {
        let rows = self.retrieval.relevant_profiles(user_id, conversation, overrides).await?;
        Ok(group_profiles(&rows))
    }

    /// The full rendered context string (spec §4.7 stages 1-5).
    pub async fn get_conversation_context(
        &self,
        user_id: &str,
        conversation: &[ChatMessage],
        overrides: &RetrievalOverrides,
    ) -> Result<String, CoreError> {
        self.retrieval.conversation_context(user_id, conversation, overrides).await
    }

    /// Implemented as `get_relevant_profiles` over a synthetic one-message
    /// conversation containing `query` (spec §4.8): the core deliberately
    /// reuses the filter path instead of adding a second index.
    pub async fn search_profiles(
        &self,
        user_id: &str,
        query: &str,
        topics: Option<&[String]>,
        max_results: usize,
    ) -> Result<Vec<Profile>, CoreError> {
        let conversation = vec![ChatMessage::new(MessageRole::User, query)];
        let overrides = RetrievalOverrides {
            only_topics: topics.map(|t| t.to_vec()),
            ..Default::default()
        };
        let mut rows = self.retrieval.relevant_profiles(user_id, &conversation, &overrides).await?;
        rows.truncate(max_results);
        Ok(group_profiles(&rows))
    }
}
