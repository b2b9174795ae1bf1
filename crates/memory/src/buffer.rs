//! The buffer manager (C4, spec §4.4): a per-`(user, blob_type)`
//! append-only queue of unprocessed blobs with flush-trigger logic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use memobase_config::{BufferConfig, ProfileTopicConfig};
use uuid::Uuid;

use crate::blob::{Blob, BlobType, Tokenizer};
use crate::error::CoreError;
use crate::extraction::ExtractionResult;
use crate::schema::{BufferEntry, BufferStatus};

/// Injected by the façade so `flush()` can run the extraction pipeline
/// (spec §4.4 step 3) without this module depending on extraction's
/// internals — only on the shape of its result.
#[async_trait]
pub trait ExtractionRunner: Send + Sync {
    async fn run(
        &self,
        user_id: &str,
        batch: Vec<Blob>,
        profile_config: &ProfileTopicConfig,
    ) -> Result<ExtractionResult, CoreError>;
}

/// Durable blob bodies (spec §6's `blob_content` table). Append-only: blobs
/// are never deleted by the core.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, blob: Blob) -> Result<(), CoreError>;
    /// Fetches blobs by id; ids with no matching row are omitted from the
    /// result rather than raising a `NotFound` — per spec §4.4 step 2 the
    /// buffer row lookup and the blob lookup are independent.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Blob>, CoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: std::sync::Mutex<HashMap<Uuid, Blob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, blob: Blob) -> Result<(), CoreError> {
        self.blobs.lock().expect("blob store mutex poisoned").insert(blob.id, blob);
        Ok(())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Blob>, CoreError> {
        let guard = self.blobs.lock().expect("blob store mutex poisoned");
        Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }
}

/// The `buffer_zone` table (spec §6). Keyed internally by `(user_id,
/// blob_type)` so insertion order and idle-ness are cheap to query per
/// queue.
pub struct BufferManager {
    blobs: Box<dyn BlobStore>,
    rows: std::sync::Mutex<HashMap<(String, BlobTypeKey), Vec<BufferEntry>>>,
}

/// `BlobType` isn't `Hash`/`Eq` by derive choice (it mirrors the wire enum
/// exactly); this newtype gives the internal index a hashable key without
/// widening the public type's derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlobTypeKey(u8);

impl From<BlobType> for BlobTypeKey {
    fn from(value: BlobType) -> Self {
        match value {
            BlobType::Chat => BlobTypeKey(0),
            BlobType::Doc => BlobTypeKey(1),
            BlobType::Code => BlobTypeKey(2),
        }
    }
}

impl BufferManager {
    pub fn new(blobs: Box<dyn BlobStore>) -> Self {
        Self {
            blobs,
            rows: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Persists the blob body and a fresh `idle` buffer entry. Insertion is
    /// linearizable per user because of the store-wide mutex; idle entries
    /// are returned in insertion order downstream.
    pub async fn insert(
        &self,
        user_id: &str,
        blob: Blob,
        tokenizer: &Tokenizer,
    ) -> Result<Uuid, CoreError> {
        let blob_type = blob.blob_type();
        let token_size = tokenizer.count_blob(&blob);
        let buffer_id = Uuid::new_v4();
        let entry = BufferEntry {
            buffer_id,
            user_id: user_id.to_string(),
            blob_id: blob.id,
            blob_type,
            token_size,
            status: BufferStatus::Idle,
            created_at: Utc::now(),
        };

        self.blobs.put(blob).await?;
        let mut guard = self.rows.lock().expect("buffer rows mutex poisoned");
        guard
            .entry((user_id.to_string(), blob_type.into()))
            .or_default()
            .push(entry);
        Ok(buffer_id)
    }

    pub fn capacity(&self, user_id: &str, blob_type: BlobType) -> usize {
        self.idle_entries(user_id, blob_type).len()
    }

    pub fn idle_ids(&self, user_id: &str, blob_type: BlobType) -> Vec<Uuid> {
        self.idle_entries(user_id, blob_type)
            .iter()
            .map(|e| e.buffer_id)
            .collect()
    }

    fn idle_entries(&self, user_id: &str, blob_type: BlobType) -> Vec<BufferEntry> {
        let guard = self.rows.lock().expect("buffer rows mutex poisoned");
        guard
            .get(&(user_id.to_string(), blob_type.into()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.status == BufferStatus::Idle)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The idle prefix whose summed `token_size` first exceeds
    /// `config.max_chat_blob_buffer_token_size`, plus any idle entry older
    /// than `config.max_buffer_age_secs`. Empty if neither condition holds.
    pub fn flush_candidates(
        &self,
        user_id: &str,
        blob_type: BlobType,
        config: &BufferConfig,
    ) -> Vec<Uuid> {
        let idle = self.idle_entries(user_id, blob_type);
        let mut running_total = 0usize;
        let mut by_threshold: Vec<Uuid> = Vec::new();
        let mut crossed = false;
        for entry in &idle {
            by_threshold.push(entry.buffer_id);
            running_total += entry.token_size;
            if running_total > config.max_chat_blob_buffer_token_size {
                crossed = true;
                break;
            }
        }
        if !crossed {
            by_threshold.clear();
        }

        let age_cutoff = Utc::now() - Duration::seconds(config.max_buffer_age_secs);
        let mut by_age: Vec<Uuid> = idle
            .iter()
            .filter(|e| e.created_at < age_cutoff)
            .map(|e| e.buffer_id)
            .collect();

        for id in by_threshold {
            if !by_age.contains(&id) {
                by_age.push(id);
            }
        }
        by_age
    }

    /// Runs the full flush contract (spec §4.4 steps 1–4). Entries not in
    /// `idle` at transition time are dropped silently, making concurrent
    /// flushes of the same buffer safe.
    pub async fn flush(
        &self,
        user_id: &str,
        blob_type: BlobType,
        buffer_ids: &[Uuid],
        profile_config: &ProfileTopicConfig,
        runner: &dyn ExtractionRunner,
    ) -> Result<ExtractionResult, CoreError> {
        let transitioned = self.transition(user_id, blob_type, buffer_ids, BufferStatus::Processing);
        if transitioned.is_empty() {
            return Ok(ExtractionResult::empty());
        }

        let blob_ids: Vec<Uuid> = {
            let guard = self.rows.lock().expect("buffer rows mutex poisoned");
            guard
                .get(&(user_id.to_string(), blob_type.into()))
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| transitioned.contains(&e.buffer_id))
                        .map(|e| e.blob_id)
                        .collect()
                })
                .unwrap_or_default()
        };
        let batch = self.blobs.get_many(&blob_ids).await?;

        match runner.run(user_id, batch, profile_config).await {
            Ok(result) => {
                self.transition(user_id, blob_type, &transitioned, BufferStatus::Done);
                Ok(result)
            }
            Err(err) => {
                self.transition(user_id, blob_type, &transitioned, BufferStatus::Failed);
                Err(err)
            }
        }
    }

    /// Atomically moves every entry in `ids` that is currently `idle` (or,
    /// for the done/failed step, `processing`) into `next`. Entries not in
    /// the expected source state are left alone. Returns the ids actually
    /// transitioned.
    fn transition(
        &self,
        user_id: &str,
        blob_type: BlobType,
        ids: &[Uuid],
        next: BufferStatus,
    ) -> Vec<Uuid> {
        let mut guard = self.rows.lock().expect("buffer rows mutex poisoned");
        let Some(entries) = guard.get_mut(&(user_id.to_string(), blob_type.into())) else {
            return Vec::new();
        };
        let mut transitioned = Vec::new();
        for entry in entries.iter_mut() {
            if !ids.contains(&entry.buffer_id) {
                continue;
            }
            if entry.status.can_transition_to(next) {
                entry.status = next;
                transitioned.push(entry.buffer_id);
            }
        }
        transitioned
    }
}
