//! The event store (C3, spec §4.3): two logical indices — `events` for
//! audit and `event_gists` for retrieval.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::schema::{Event, EventGist};

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn put_event(
        &self,
        user_id: &str,
        event_data: serde_json::Value,
        embedding: Option<Vec<f32>>,
    ) -> Result<Uuid, CoreError>;

    async fn put_gist(
        &self,
        user_id: &str,
        event_id: Uuid,
        content: String,
        embedding: Option<Vec<f32>>,
    ) -> Result<Uuid, CoreError>;

    /// Chronologically descending, within `window_days` of now.
    async fn recent_gists(
        &self,
        user_id: &str,
        topk: usize,
        window_days: i64,
    ) -> Result<Vec<EventGist>, CoreError>;

    /// Cosine similarity ≥ `threshold`, within `window_days`; gists without
    /// an embedding are skipped; ties broken by `created_at` descending.
    /// Refuses with `CoreError::NotImplemented` when `embeddings_enabled`
    /// is false rather than silently degrading to a non-vector search —
    /// that fallback belongs to the retrieval assembler (C7), which calls
    /// `recent_gists` itself when it knows embeddings are off.
    async fn search_gists(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        topk: usize,
        threshold: f32,
        window_days: i64,
        embeddings_enabled: bool,
    ) -> Result<Vec<(EventGist, f32)>, CoreError>;
}

#[derive(Debug, Default)]
struct UserEvents {
    events: Vec<Event>,
    gists: Vec<EventGist>,
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    by_user: std::sync::Mutex<HashMap<String, UserEvents>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn window_start(window_days: i64) -> DateTime<Utc> {
        Utc::now() - Duration::days(window_days)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put_event(
        &self,
        user_id: &str,
        event_data: serde_json::Value,
        embedding: Option<Vec<f32>>,
    ) -> Result<Uuid, CoreError> {
        let event = Event {
            event_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event_data,
            embedding,
            created_at: Utc::now(),
        };
        let event_id = event.event_id;
        let mut guard = self.by_user.lock().expect("event store mutex poisoned");
        guard.entry(user_id.to_string()).or_default().events.push(event);
        Ok(event_id)
    }

    async fn put_gist(
        &self,
        user_id: &str,
        event_id: Uuid,
        content: String,
        embedding: Option<Vec<f32>>,
    ) -> Result<Uuid, CoreError> {
        let gist = EventGist {
            gist_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event_id,
            content,
            embedding,
            created_at: Utc::now(),
        };
        let gist_id = gist.gist_id;
        let mut guard = self.by_user.lock().expect("event store mutex poisoned");
        guard.entry(user_id.to_string()).or_default().gists.push(gist);
        Ok(gist_id)
    }

    async fn recent_gists(
        &self,
        user_id: &str,
        topk: usize,
        window_days: i64,
    ) -> Result<Vec<EventGist>, CoreError> {
        let cutoff = Self::window_start(window_days);
        let guard = self.by_user.lock().expect("event store mutex poisoned");
        let mut gists: Vec<EventGist> = guard
            .get(user_id)
            .map(|u| u.gists.iter().filter(|g| g.created_at > cutoff).cloned().collect())
            .unwrap_or_default();
        gists.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        gists.truncate(topk);
        Ok(gists)
    }

    async fn search_gists(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        topk: usize,
        threshold: f32,
        window_days: i64,
        embeddings_enabled: bool,
    ) -> Result<Vec<(EventGist, f32)>, CoreError> {
        if !embeddings_enabled {
            return Err(CoreError::NotImplemented(
                "vector search over event gists requires enable_event_embedding".to_string(),
            ));
        }
        let cutoff = Self::window_start(window_days);
        let guard = self.by_user.lock().expect("event store mutex poisoned");
        let mut scored: Vec<(EventGist, f32)> = guard
            .get(user_id)
            .map(|u| {
                u.gists
                    .iter()
                    .filter(|g| g.created_at > cutoff)
                    .filter_map(|g| {
                        let embedding = g.embedding.as_ref()?;
                        let similarity = cosine_similarity(query_embedding, embedding);
                        (similarity >= threshold).then(|| (g.clone(), similarity))
                    })
                    .collect()
            })
            .unwrap_or_default();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.created_at.cmp(&a.0.created_at))
        });
        scored.truncate(topk);
        Ok(scored)
    }
}
