//! Shared test doubles for the integration suite. One file per
//! `original_source/lindormmemobase/tests/test_*.py` counterpart exercises
//! `Memobase` end to end through this module's scripted LLM.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use memobase_config::Config;
use memobase_llm::{CompleteRequest, EmbedPhase};
use memobase_memory::blob::{Blob, BlobPayload, ChatMessage, MessageRole};
use memobase_memory::buffer::InMemoryBlobStore;
use memobase_memory::error::CoreError;
use memobase_memory::event_store::InMemoryEventStore;
use memobase_memory::llm_port::LlmPort;
use memobase_memory::profile_store::InMemoryProfileStore;
use memobase_memory::Memobase;
use tokio::sync::Mutex as AsyncMutex;

/// Pops canned `complete_json` responses off a queue in call order;
/// `embed` returns a fixed unit vector per input so cosine similarity in
/// the in-memory event store stays well-defined without a real model.
pub struct ScriptedLlm {
    json_responses: AsyncMutex<VecDeque<serde_json::Value>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<serde_json::Value>) -> Self {
        Self {
            json_responses: AsyncMutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn complete_json(&self, _request: &CompleteRequest) -> Result<serde_json::Value, CoreError> {
        self.json_responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| CoreError::Internal("scripted llm exhausted".to_string()))
    }

    async fn complete_text(&self, _request: &CompleteRequest) -> Result<String, CoreError> {
        Ok(String::new())
    }

    async fn embed(&self, texts: &[String], _phase: EmbedPhase, _model: &str) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.llm.llm_api_key = "test".to_string();
    config.embedding.embedding_api_key = "test".to_string();
    config
}

pub fn memobase_with(config: Config, llm: ScriptedLlm) -> Memobase {
    Memobase::with_stores(
        config,
        Arc::new(InMemoryProfileStore::new()),
        Arc::new(InMemoryEventStore::new()),
        Box::new(InMemoryBlobStore::new()),
        Arc::new(llm),
    )
    .expect("config is valid")
}

/// A shared profile store plus a way to stand up successive `Memobase`
/// instances over it — the same sequencing `extraction.rs`'s own
/// `cold_start`/`second_batch` pair of tests uses, lifted to façade level so
/// a scenario can drive "one call, then a follow-up call with a different
/// scripted response" without `Memobase` needing a store accessor.
pub struct Harness {
    pub profiles: Arc<InMemoryProfileStore>,
    pub events: Arc<InMemoryEventStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(InMemoryProfileStore::new()),
            events: Arc::new(InMemoryEventStore::new()),
        }
    }

    pub fn memobase(&self, config: Config, llm: ScriptedLlm) -> Memobase {
        Memobase::with_stores(
            config,
            self.profiles.clone(),
            self.events.clone(),
            Box::new(InMemoryBlobStore::new()),
            Arc::new(llm),
        )
        .expect("config is valid")
    }
}

pub fn chat_blob(user: &str, text: &str) -> Blob {
    Blob::new(
        user,
        BlobPayload::Chat {
            messages: vec![ChatMessage::new(MessageRole::User, text)],
        },
        Utc::now(),
    )
}
