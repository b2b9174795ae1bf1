//! The profile store (C2, spec §4.2).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::schema::{ProfileAttributes, ProfileEntry};

/// New row content passed to [`ProfileStore::add`].
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub content: String,
    pub attributes: ProfileAttributes,
}

/// A single row update passed to [`ProfileStore::update`]. `attributes:
/// None` leaves the existing attributes untouched.
#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    pub profile_id: Uuid,
    pub content: String,
    pub attributes: Option<ProfileAttributes>,
}

/// Storage contract for profile rows. All mutations are single-row; the
/// merge planner (C6) produces an idempotent action list, so no cross-row
/// transaction is required here.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn add(&self, user_id: &str, profiles: Vec<NewProfile>) -> Result<Vec<Uuid>, CoreError>;

    /// Rewrites content (and attributes, if given) and bumps `updated_at`.
    /// Rows that don't exist are silently skipped — not reported as a
    /// failure — so the returned list may be shorter than the input.
    async fn update(&self, user_id: &str, updates: Vec<ProfileUpdate>) -> Result<Vec<Uuid>, CoreError>;

    async fn delete(&self, user_id: &str, profile_ids: Vec<Uuid>) -> Result<usize, CoreError>;

    /// Rows for `user_id`, ordered by `updated_at` descending, optionally
    /// capped at `limit`.
    async fn list(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<ProfileEntry>, CoreError>;
}

/// Reference in-memory implementation. The two backing stores named in
/// spec §1 are external collaborators in production; this satisfies the
/// trait for tests and for any deployment small enough not to need a real
/// wide-table store.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    rows: std::sync::Mutex<HashMap<String, Vec<ProfileEntry>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn add(&self, user_id: &str, profiles: Vec<NewProfile>) -> Result<Vec<Uuid>, CoreError> {
        let now = Utc::now();
        let mut guard = self.rows.lock().expect("profile store mutex poisoned");
        let bucket = guard.entry(user_id.to_string()).or_default();
        let mut ids = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let entry = ProfileEntry {
                profile_id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                content: profile.content,
                attributes: profile.attributes,
                created_at: now,
                updated_at: now,
            };
            ids.push(entry.profile_id);
            bucket.push(entry);
        }
        Ok(ids)
    }

    async fn update(&self, user_id: &str, updates: Vec<ProfileUpdate>) -> Result<Vec<Uuid>, CoreError> {
        let now = Utc::now();
        let mut guard = self.rows.lock().expect("profile store mutex poisoned");
        let Some(bucket) = guard.get_mut(user_id) else {
            return Ok(Vec::new());
        };
        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(row) = bucket.iter_mut().find(|r| r.profile_id == update.profile_id) {
                row.content = update.content;
                if let Some(attributes) = update.attributes {
                    row.attributes = attributes;
                }
                row.updated_at = now;
                applied.push(update.profile_id);
            }
        }
        Ok(applied)
    }

    async fn delete(&self, user_id: &str, profile_ids: Vec<Uuid>) -> Result<usize, CoreError> {
        let mut guard = self.rows.lock().expect("profile store mutex poisoned");
        let Some(bucket) = guard.get_mut(user_id) else {
            return Ok(0);
        };
        let before = bucket.len();
        bucket.retain(|row| !profile_ids.contains(&row.profile_id));
        Ok(before - bucket.len())
    }

    async fn list(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<ProfileEntry>, CoreError> {
        let guard = self.rows.lock().expect("profile store mutex poisoned");
        let mut rows = guard.get(user_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(topic: &str, sub_topic: &str) -> ProfileAttributes {
        ProfileAttributes::new(topic, sub_topic)
    }

    #[tokio::test]
    async fn add_then_list_returns_newest_first() {
        let store = InMemoryProfileStore::new();
        store
            .add(
                "u1",
                vec![NewProfile {
                    content: "plays jazz guitar".to_string(),
                    attributes: attrs("hobbies", "music"),
                }],
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .add(
                "u1",
                vec![NewProfile {
                    content: "works as a chef".to_string(),
                    attributes: attrs("career", "current_role"),
                }],
            )
            .await
            .unwrap();

        let rows = store.list("u1", None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "works as a chef");
    }

    #[tokio::test]
    async fn update_of_missing_row_is_silently_skipped() {
        let store = InMemoryProfileStore::new();
        let applied = store
            .update(
                "u1",
                vec![ProfileUpdate {
                    profile_id: Uuid::new_v4(),
                    content: "irrelevant".to_string(),
                    attributes: None,
                }],
            )
            .await
            .unwrap();
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn update_bumps_updated_at_and_preserves_attributes_when_not_given() {
        let store = InMemoryProfileStore::new();
        let ids = store
            .add(
                "u1",
                vec![NewProfile {
                    content: "plays guitar".to_string(),
                    attributes: attrs("hobbies", "music"),
                }],
            )
            .await
            .unwrap();
        let id = ids[0];
        let before = store.list("u1", None).await.unwrap()[0].updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let applied = store
            .update(
                "u1",
                vec![ProfileUpdate {
                    profile_id: id,
                    content: "plays guitar and violin".to_string(),
                    attributes: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(applied, vec![id]);

        let rows = store.list("u1", None).await.unwrap();
        assert_eq!(rows[0].content, "plays guitar and violin");
        assert_eq!(rows[0].attributes.topic, "hobbies");
        assert!(rows[0].updated_at > before);
    }

    #[tokio::test]
    async fn delete_reports_the_actual_removed_count() {
        let store = InMemoryProfileStore::new();
        let ids = store
            .add(
                "u1",
                vec![
                    NewProfile { content: "a".to_string(), attributes: attrs("t", "s1") },
                    NewProfile { content: "b".to_string(), attributes: attrs("t", "s2") },
                ],
            )
            .await
            .unwrap();

        let mut to_delete = ids.clone();
        to_delete.push(Uuid::new_v4());
        let removed = store.delete("u1", to_delete).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list("u1", None).await.unwrap().is_empty());
    }
}
