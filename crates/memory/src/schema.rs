//! Durable row shapes for the profile store (C2) and event store (C3), plus
//! the buffer's own bookkeeping row (C4). See spec §3 and §6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobType;

/// `{topic, sub_topic, ...}` — the taxonomy slot a profile row is filed
/// under, plus whatever else extraction wants to carry (e.g. a confidence
/// score). `topic`/`sub_topic` are promoted to real fields because the
/// merge planner keys on them constantly; everything else stays in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileAttributes {
    pub topic: String,
    pub sub_topic: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProfileAttributes {
    pub fn new(topic: impl Into<String>, sub_topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            sub_topic: sub_topic.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// One row of `user_profiles` (spec §6). `(user_id, topic, sub_topic)` is
/// logically unique — enforced by the merge planner (C6), not by this
/// type — and `updated_at` only ever moves forward for a given row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub profile_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub attributes: ProfileAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An audit record of one extraction batch (spec §3, §6). `event_data`
/// records the conversation context and the merge plan applied; `embedding`
/// is optional because not every deployment embeds events themselves (only
/// gists are required to be searchable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub user_id: String,
    pub event_data: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A single discrete fact or episode extracted from one event, embedded so
/// it can be found by similarity search (C3). Gists share the time-decay
/// policy of their parent event — there is no independent gist lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventGist {
    pub gist_id: Uuid,
    pub user_id: String,
    pub event_id: Uuid,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// The buffer's `idle → processing → done|failed` state machine (spec
/// §3, §4.4). There is no variant for "back to idle" — the type itself
/// makes the invariant "a buffer entry never returns to idle" structural,
/// not just enforced by the store's logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Idle,
    Processing,
    Done,
    Failed,
}

impl BufferStatus {
    /// `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: BufferStatus) -> bool {
        matches!(
            (self, next),
            (BufferStatus::Idle, BufferStatus::Processing)
                | (BufferStatus::Processing, BufferStatus::Done)
                | (BufferStatus::Processing, BufferStatus::Failed)
        )
    }
}

/// One row of `buffer_zone` (spec §6). Exactly one entry exists per
/// buffered blob per user; `token_size` is fixed at insertion time and
/// never recomputed, even if the tokenizer's behavior were to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEntry {
    pub buffer_id: Uuid,
    pub user_id: String,
    pub blob_id: Uuid,
    pub blob_type: BlobType,
    pub token_size: usize,
    pub status: BufferStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_status_forbids_backward_transitions() {
        assert!(BufferStatus::Idle.can_transition_to(BufferStatus::Processing));
        assert!(!BufferStatus::Processing.can_transition_to(BufferStatus::Idle));
        assert!(!BufferStatus::Done.can_transition_to(BufferStatus::Idle));
        assert!(!BufferStatus::Failed.can_transition_to(BufferStatus::Processing));
    }

    #[test]
    fn buffer_status_forbids_done_to_failed_and_back() {
        assert!(!BufferStatus::Done.can_transition_to(BufferStatus::Failed));
        assert!(!BufferStatus::Failed.can_transition_to(BufferStatus::Done));
    }
}
