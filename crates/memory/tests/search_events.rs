//! Mirrors `original_source/lindormmemobase/tests/test_search_events.py`:
//! event search and context assembly with embeddings on and off, driven end
//! to end through the façade.

mod support;

use memobase_memory::blob::{ChatMessage, MessageRole};
use memobase_memory::event_store::EventStore;
use memobase_memory::retrieval::RetrievalOverrides;
use memobase_memory::CoreError;
use serde_json::json;
use support::{base_config, Harness, ScriptedLlm};

#[tokio::test]
async fn search_events_surfaces_not_implemented_when_embeddings_are_disabled() {
    let mut config = base_config();
    config.embedding.enable_event_embedding = false;
    let memobase = Harness::new().memobase(config, ScriptedLlm::new(vec![]));

    let result = memobase.search_events("u1", "jazz guitar", 10, 0.2, 30).await;
    assert!(matches!(result, Err(CoreError::NotImplemented(_))));
}

#[tokio::test]
async fn conversation_context_falls_back_to_recent_gists_without_embeddings() {
    let mut config = base_config();
    config.embedding.enable_event_embedding = false;
    config.retrieval.full_profile_and_only_search_event = true;

    let harness = Harness::new();
    let event_id = harness.events.put_event("u1", json!({}), None).await.unwrap();
    harness
        .events
        .put_gist("u1", event_id, "talked about jazz guitar".to_string(), None)
        .await
        .unwrap();

    let memobase = harness.memobase(config, ScriptedLlm::new(vec![]));
    let tail = vec![ChatMessage::new(MessageRole::User, "tell me about my hobbies")];
    let context = memobase
        .get_conversation_context("u1", &tail, &RetrievalOverrides::default())
        .await
        .unwrap();

    assert!(context.contains("## Past Events:"));
    assert!(context.contains("talked about jazz guitar"));
}

#[tokio::test]
async fn search_events_returns_similarity_scored_gists_when_embeddings_are_enabled() {
    let config = base_config();
    let harness = Harness::new();
    let event_id = harness.events.put_event("u1", json!({}), None).await.unwrap();
    harness
        .events
        .put_gist("u1", event_id, "talked about jazz guitar".to_string(), Some(vec![1.0, 0.0]))
        .await
        .unwrap();

    let memobase = harness.memobase(config, ScriptedLlm::new(vec![]));
    let results = memobase.search_events("u1", "jazz guitar", 10, 0.2, 30).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.content, "talked about jazz guitar");
    assert!(results[0].1 > 0.9);
}
