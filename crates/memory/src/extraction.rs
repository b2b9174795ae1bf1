//! The extraction pipeline (C6, spec §4.6): batch → facts → merge plan →
//! apply → event synthesis → merge splits.
//!
//! Every stage up to and including apply (stage 5) is transactional at the
//! batch boundary — either the whole plan lands in the profile store or the
//! error propagates and the caller (the buffer manager) flips the entries to
//! `failed`. Event synthesis (stage 6) is best-effort: a failure there never
//! un-does an already-applied profile mutation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use memobase_config::{Config, ProfileTopicConfig};
use memobase_llm::{CompleteRequest, EmbedPhase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::blob::{Blob, Tokenizer};
use crate::buffer::ExtractionRunner;
use crate::error::CoreError;
use crate::event_store::EventStore;
use crate::llm_port::LlmPort;
use crate::profile_store::{NewProfile, ProfileStore, ProfileUpdate};
use crate::schema::ProfileAttributes;

/// `{add_ids, update_ids, delete_ids, event_id}` (spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionResult {
    pub add_ids: Vec<Uuid>,
    pub update_ids: Vec<Uuid>,
    pub delete_ids: Vec<Uuid>,
    pub event_id: Option<Uuid>,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge per-split results (stage 7): concatenate, then dedupe
    /// `add_ids`/`update_ids` by profile id. `event_id` is kept from the
    /// first split that produced one — splits beyond the first still run
    /// event synthesis, but only one event per flush is reported back.
    pub(crate) fn merge(results: Vec<ExtractionResult>) -> Self {
        let mut merged = ExtractionResult::empty();
        for result in results {
            for id in result.add_ids {
                if !merged.add_ids.contains(&id) {
                    merged.add_ids.push(id);
                }
            }
            for id in result.update_ids {
                if !merged.update_ids.contains(&id) {
                    merged.update_ids.push(id);
                }
            }
            for id in result.delete_ids {
                if !merged.delete_ids.contains(&id) {
                    merged.delete_ids.push(id);
                }
            }
            if merged.event_id.is_none() {
                merged.event_id = result.event_id;
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawFact {
    topic: String,
    sub_topic: String,
    #[serde(default)]
    memo: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FactExtractionResponse {
    #[serde(default)]
    facts: Vec<RawFact>,
}

#[derive(Debug, Clone, Deserialize)]
struct MergeDecisionResponse {
    action: String,
    #[serde(default)]
    memo: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmResponse {
    #[serde(default)]
    confirmed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct EventSynthesisResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    gists: Vec<String>,
}

/// One validated extraction candidate, post stage-2 validation.
#[derive(Debug, Clone)]
struct ValidatedFact {
    topic: String,
    sub_topic: String,
    memo: String,
}

/// A `(topic, sub_topic)` slot's state as the merge planner walks this
/// batch's facts in order. Chronological ties within one batch resolve by
/// letting the later fact update this in-memory row before anything hits
/// storage (spec §4.6 stage 4).
struct WorkingRow {
    existing_id: Option<Uuid>,
    content: String,
    touched: bool,
    deleted: bool,
}

pub struct ExtractionPipeline {
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn EventStore>,
    llm: Arc<dyn LlmPort>,
    tokenizer: Arc<Tokenizer>,
    config: Config,
}

impl ExtractionPipeline {
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

    /// Runs the full pipeline for one flushed batch (spec §4.6 stages 1–7).
    pub async fn extract(
        &self,
        user_id: &str,
        batch: Vec<Blob>,
        profile_config: &ProfileTopicConfig,
    ) -> Result<ExtractionResult, CoreError> {
        if batch.is_empty() {
            return Ok(ExtractionResult::empty());
        }

        let splits = self.split_batch(batch);
        let mut results = Vec::with_capacity(splits.len());
        for split in splits {
            results.push(self.run_split(user_id, split, profile_config).await?);
        }
        Ok(ExtractionResult::merge(results))
    }

    /// Stage 1 (compose/split): splits on blob boundaries once the rendered
    /// text would exceed `max_chat_blob_buffer_process_token_size`. A single
    /// blob larger than the ceiling still gets its own split rather than
    /// being dropped or truncated.
    fn split_batch(&self, batch: Vec<Blob>) -> Vec<Vec<Blob>> {
        let ceiling = self.config.buffer.max_chat_blob_buffer_process_token_size;
        let mut splits: Vec<Vec<Blob>> = Vec::new();
        let mut current: Vec<Blob> = Vec::new();
        let mut current_tokens = 0usize;

        for blob in batch {
            let blob_tokens = self.tokenizer.count_blob(&blob);
            if !current.is_empty() && current_tokens + blob_tokens > ceiling {
                splits.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += blob_tokens;
            current.push(blob);
        }
        if !current.is_empty() {
            splits.push(current);
        }
        splits
    }

    async fn run_split(
        &self,
        user_id: &str,
        split: Vec<Blob>,
        profile_config: &ProfileTopicConfig,
    ) -> Result<ExtractionResult, CoreError> {
        let prompt_text = compose_prompt(&split);

        let facts = self.extract_facts(&prompt_text, profile_config).await?;
        if facts.is_empty() {
            return Ok(ExtractionResult::empty());
        }

        let existing = self.profiles.list(user_id, None).await?;
        let mut existing_index: HashMap<(String, String), Uuid> = HashMap::new();
        let mut existing_content: HashMap<Uuid, String> = HashMap::new();
        for row in &existing {
            existing_index.insert(
                (row.attributes.topic.clone(), row.attributes.sub_topic.clone()),
                row.profile_id,
            );
            existing_content.insert(row.profile_id, row.content.clone());
        }

        let (working, deltas) = self.plan_merge(&facts, &existing_index, &existing_content).await?;

        let (add_ids, update_ids, delete_ids) = self.apply_plan(user_id, working).await?;

        let event_id = self
            .synthesize_event(user_id, &prompt_text, &deltas, &add_ids, &update_ids, &delete_ids)
            .await;

        Ok(ExtractionResult {
            add_ids,
            update_ids,
            delete_ids,
            event_id,
        })
    }

    /// Stage 2: one JSON-mode LLM call, then per-fact validation
    /// (taxonomy membership, sub-topic cap, empty-memo discard).
    async fn extract_facts(
        &self,
        prompt_text: &str,
        profile_config: &ProfileTopicConfig,
    ) -> Result<Vec<ValidatedFact>, CoreError> {
        let taxonomy = profile_config.resolve();
        let taxonomy_block = taxonomy
            .iter()
            .map(|t| {
                format!(
                    "- {} ({}): {}",
                    t.topic,
                    t.sub_topics.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", "),
                    t.description.clone().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Extract discrete facts about the user from the conversation below. \
             Use only these topics and sub-topics where possible:\n{taxonomy_block}\n\n\
             Conversation:\n{prompt_text}\n\n\
             Respond with JSON: {{\"facts\": [{{\"topic\": str, \"sub_topic\": str, \"memo\": str}}]}}"
        );
        let request = CompleteRequest::new(self.config.llm.best_llm_model.clone(), prompt).json();
        let value = self.llm.complete_json(&request).await?;
        let parsed: FactExtractionResponse = serde_json::from_value(value)
            .map_err(|err| CoreError::Unprocessable(format!("fact extraction response: {err}")))?;

        let mut per_topic_subtopics: HashMap<String, Vec<String>> = HashMap::new();
        let mut validated = Vec::new();
        for fact in parsed.facts {
            if fact.memo.trim().is_empty() {
                continue;
            }
            let topic = if profile_config.contains_topic(&fact.topic) {
                fact.topic
            } else if self.config.profile.profile_strict_mode {
                continue;
            } else {
                profile_config.fallback_topic.clone()
            };

            let subtopics = per_topic_subtopics.entry(topic.clone()).or_default();
            if !subtopics.contains(&fact.sub_topic) {
                if subtopics.len() >= self.config.profile.max_profile_subtopics {
                    continue;
                }
                subtopics.push(fact.sub_topic.clone());
            }

            validated.push(ValidatedFact {
                topic,
                sub_topic: fact.sub_topic,
                memo: fact.memo,
            });
        }
        Ok(validated)
    }

    /// Stage 3+4: load existing profile, then decide add/update/delete per
    /// fact, letting later facts in this batch override earlier ones for the
    /// same slot before anything is written to storage.
    async fn plan_merge(
        &self,
        facts: &[ValidatedFact],
        existing_index: &HashMap<(String, String), Uuid>,
        existing_content: &HashMap<Uuid, String>,
    ) -> Result<(HashMap<(String, String), WorkingRow>, Vec<String>), CoreError> {
        let mut working: HashMap<(String, String), WorkingRow> = HashMap::new();
        let mut deltas = Vec::new();

        for fact in facts {
            let slot = (fact.topic.clone(), fact.sub_topic.clone());
            if !working.contains_key(&slot) {
                let row = match existing_index.get(&slot) {
                    Some(&id) => WorkingRow {
                        existing_id: Some(id),
                        content: existing_content.get(&id).cloned().unwrap_or_default(),
                        touched: false,
                        deleted: false,
                    },
                    None => WorkingRow {
                        existing_id: None,
                        content: String::new(),
                        touched: false,
                        deleted: false,
                    },
                };
                working.insert(slot.clone(), row);
            }

            let is_new = working[&slot].existing_id.is_none() && !working[&slot].touched;
            if is_new {
                let row = working.get_mut(&slot).unwrap();
                row.content = fact.memo.clone();
                row.touched = true;
                deltas.push(fact.memo.clone());
                continue;
            }

            let current_content = working[&slot].content.clone();
            let decision = self.merge_decision(&current_content, &fact.memo).await?;
            match decision.action.as_str() {
                "keep" => {}
                "contradict" => {
                    let confirmed = if self.config.profile.profile_validate_mode {
                        self.confirm_contradiction(&current_content, &fact.memo).await?
                    } else {
                        false
                    };
                    let row = working.get_mut(&slot).unwrap();
                    if confirmed {
                        row.deleted = true;
                        row.touched = true;
                        deltas.push(format!("retracted: {}", fact.memo));
                    } else {
                        // Deletion is gated off; fall back to an ordinary
                        // update so the contradiction isn't silently lost.
                        row.content = decision.memo;
                        row.touched = true;
                        deltas.push(fact.memo.clone());
                    }
                }
                _ => {
                    // "append" | "replace", and any forward-compatible verb.
                    let row = working.get_mut(&slot).unwrap();
                    row.content = decision.memo;
                    row.touched = true;
                    deltas.push(fact.memo.clone());
                }
            }
        }

        Ok((working, deltas))
    }

    async fn merge_decision(&self, existing_memo: &str, new_memo: &str) -> Result<MergeDecisionResponse, CoreError> {
        let prompt = format!(
            "Existing profile memo: {existing_memo:?}\nNew candidate memo: {new_memo:?}\n\
             Decide how to reconcile them. Respond with JSON: \
             {{\"action\": \"append\"|\"replace\"|\"keep\"|\"contradict\", \"memo\": str}}. \
             Use \"keep\" when the new memo adds nothing. Use \"contradict\" only when the new \
             memo directly contradicts and supersedes the existing one."
        );
        let request = CompleteRequest::new(self.config.llm.thinking_llm_model.clone(), prompt).json();
        let value = self.llm.complete_json(&request).await?;
        serde_json::from_value(value)
            .map_err(|err| CoreError::Unprocessable(format!("merge decision response: {err}")))
    }

    /// Second confirmation call required by `profile_validate_mode` before a
    /// contradiction may become a delete (§4.6 stage 4, §9 Open Question 4).
    async fn confirm_contradiction(&self, existing_memo: &str, new_memo: &str) -> Result<bool, CoreError> {
        let prompt = format!(
            "Existing profile memo: {existing_memo:?}\nCandidate retraction: {new_memo:?}\n\
             Confirm this is a genuine contradiction that should delete the existing memo. \
             Respond with JSON: {{\"confirmed\": bool}}."
        );
        let request = CompleteRequest::new(self.config.llm.thinking_llm_model.clone(), prompt).json();
        let value = self.llm.complete_json(&request).await?;
        let parsed: ConfirmResponse = serde_json::from_value(value)
            .map_err(|err| CoreError::Unprocessable(format!("contradiction confirmation response: {err}")))?;
        Ok(parsed.confirmed)
    }

    /// Stage 5: deletes, then updates, then adds. Storage errors are
    /// retried once; a persistent failure is fatal for the batch.
    async fn apply_plan(
        &self,
        user_id: &str,
        working: HashMap<(String, String), WorkingRow>,
    ) -> Result<(Vec<Uuid>, Vec<Uuid>, Vec<Uuid>), CoreError> {
        let mut to_delete = Vec::new();
        let mut to_update = Vec::new();
        let mut to_add = Vec::new();

        for ((topic, sub_topic), row) in working {
            if row.deleted {
                if let Some(id) = row.existing_id {
                    to_delete.push(id);
                }
                continue;
            }
            if !row.touched {
                continue;
            }
            match row.existing_id {
                Some(id) => to_update.push(ProfileUpdate {
                    profile_id: id,
                    content: row.content,
                    attributes: None,
                }),
                None => to_add.push(NewProfile {
                    content: row.content,
                    attributes: ProfileAttributes::new(topic, sub_topic),
                }),
            }
        }

        let delete_ids = if to_delete.is_empty() {
            Vec::new()
        } else {
            let count = retry_once(|| self.profiles.delete(user_id, to_delete.clone())).await?;
            if count > 0 {
                to_delete
            } else {
                Vec::new()
            }
        };

        let update_ids = if to_update.is_empty() {
            Vec::new()
        } else {
            retry_once(|| self.profiles.update(user_id, to_update.clone())).await?
        };

        let add_ids = if to_add.is_empty() {
            Vec::new()
        } else {
            retry_once(|| self.profiles.add(user_id, to_add.clone())).await?
        };

        Ok((add_ids, update_ids, delete_ids))
    }

    /// Stage 6, best-effort: a failure here never rolls back stage 5's
    /// already-applied profile mutations (spec §4.6).
    async fn synthesize_event(
        &self,
        user_id: &str,
        prompt_text: &str,
        deltas: &[String],
        add_ids: &[Uuid],
        update_ids: &[Uuid],
        delete_ids: &[Uuid],
    ) -> Option<Uuid> {
        if deltas.is_empty() {
            return None;
        }
        match self.try_synthesize_event(user_id, prompt_text, deltas, add_ids, update_ids, delete_ids).await {
            Ok(event_id) => event_id,
            Err(err) => {
                warn!(user_id, error = %err, "event synthesis failed; profile mutations are preserved");
                None
            }
        }
    }

    async fn try_synthesize_event(
        &self,
        user_id: &str,
        prompt_text: &str,
        deltas: &[String],
        add_ids: &[Uuid],
        update_ids: &[Uuid],
        delete_ids: &[Uuid],
    ) -> Result<Option<Uuid>, CoreError> {
        let prompt = format!(
            "Summarize this batch of conversation in one short sentence, and list one gist \
             string per discrete fact touched:\n{prompt_text}\n\nChanges: {deltas:?}\n\n\
             Respond with JSON: {{\"summary\": str, \"gists\": [str]}}"
        );
        let request = CompleteRequest::new(self.config.llm.summary_llm_model.clone(), prompt).json();
        let value = self.llm.complete_json(&request).await?;
        let parsed: EventSynthesisResponse = serde_json::from_value(value)
            .map_err(|err| CoreError::Unprocessable(format!("event synthesis response: {err}")))?;

        let event_data = json!({
            "summary": parsed.summary,
            "add_ids": add_ids,
            "update_ids": update_ids,
            "delete_ids": delete_ids,
            "deltas": deltas,
        });

        let gist_embeddings = if self.config.embedding.enable_event_embedding && !parsed.gists.is_empty() {
            self.llm
                .embed(&parsed.gists, EmbedPhase::Index, &self.config.embedding.embedding_model)
                .await?
        } else {
            Vec::new()
        };

        let event_id = self.events.put_event(user_id, event_data, None).await?;
        for (i, gist) in parsed.gists.into_iter().enumerate() {
            let embedding = gist_embeddings.get(i).cloned();
            self.events.put_gist(user_id, event_id, gist, embedding).await?;
        }
        Ok(Some(event_id))
    }
}

#[async_trait]
impl ExtractionRunner for ExtractionPipeline {
    async fn run(
        &self,
        user_id: &str,
        batch: Vec<Blob>,
        profile_config: &ProfileTopicConfig,
    ) -> Result<ExtractionResult, CoreError> {
        self.extract(user_id, batch, profile_config).await
    }
}

/// Stage 1 (compose): chat messages are already rendered speaker-tagged by
/// [`Blob::render_text`]; doc/code blobs contribute their text as-is. Blobs
/// in a split are joined with a blank line so multi-blob batches don't run
/// their text together.
fn compose_prompt(blobs: &[Blob]) -> String {
    blobs
        .iter()
        .map(|b| b.render_text())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn retry_once<F, Fut, T>(mut f: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    match f().await {
        Ok(value) => Ok(value),
        Err(_) => f().await,
    }
}
