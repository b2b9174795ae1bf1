//! Mirrors `original_source/lindormmemobase/tests/test_search_user_profiles.py`:
//! profile merge semantics and topic-scoped retrieval, driven end to end
//! through the façade.

mod support;

use memobase_memory::profile_store::{NewProfile, ProfileStore};
use memobase_memory::retrieval::RetrievalOverrides;
use memobase_memory::schema::ProfileAttributes;
use serde_json::json;
use support::{base_config, chat_blob, Harness, ScriptedLlm};

#[tokio::test]
async fn a_later_batch_updates_the_existing_row_instead_of_duplicating_it() {
    let harness = Harness::new();
    let first = ScriptedLlm::new(vec![
        json!({"facts": [{"topic": "hobbies", "sub_topic": "music", "memo": "plays jazz guitar"}]}),
        json!({"summary": "music", "gists": ["plays jazz guitar"]}),
    ]);
    harness
        .memobase(base_config(), first)
        .extract_memories("u1", vec![chat_blob("u1", "I play jazz guitar")], None)
        .await
        .unwrap();

    let second = ScriptedLlm::new(vec![
        json!({"facts": [{"topic": "hobbies", "sub_topic": "music", "memo": "also started learning violin"}]}),
        json!({"action": "append", "memo": "plays jazz guitar and violin"}),
        json!({"summary": "music update", "gists": ["plays jazz guitar and violin"]}),
    ]);
    let memobase2 = harness.memobase(base_config(), second);
    let result = memobase2
        .extract_memories("u1", vec![chat_blob("u1", "I also started learning violin")], None)
        .await
        .unwrap();

    assert!(result.add_ids.is_empty());
    assert_eq!(result.update_ids.len(), 1);

    let profiles = memobase2.get_user_profiles("u1", None).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].subtopics["music"].content, "plays jazz guitar and violin");
}

#[tokio::test]
async fn a_confirmed_contradiction_deletes_the_row_under_validate_mode() {
    let harness = Harness::new();
    let first = ScriptedLlm::new(vec![
        json!({"facts": [{"topic": "hobbies", "sub_topic": "music", "memo": "plays jazz guitar"}]}),
        json!({"summary": "music", "gists": ["plays jazz guitar"]}),
    ]);
    harness
        .memobase(base_config(), first)
        .extract_memories("u1", vec![chat_blob("u1", "I play jazz guitar")], None)
        .await
        .unwrap();

    let mut config = base_config();
    config.profile.profile_validate_mode = true;
    let second = ScriptedLlm::new(vec![
        json!({"facts": [{"topic": "hobbies", "sub_topic": "music", "memo": "actually I never played guitar"}]}),
        json!({"action": "contradict", "memo": ""}),
        json!({"confirmed": true}),
        json!({"summary": "retraction", "gists": ["retracted guitar claim"]}),
    ]);
    let memobase2 = harness.memobase(config, second);
    let result = memobase2
        .extract_memories(
            "u1",
            vec![chat_blob("u1", "Actually I never played guitar, I was joking")],
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.delete_ids.len(), 1);
    assert!(memobase2.get_user_profiles("u1", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn prefer_topics_orders_candidates_before_other_topics() {
    let harness = Harness::new();
    harness
        .profiles
        .add(
            "u1",
            vec![
                NewProfile {
                    content: "enjoys hiking".to_string(),
                    attributes: ProfileAttributes::new("hobbies", "outdoors"),
                },
                NewProfile {
                    content: "wants a promotion".to_string(),
                    attributes: ProfileAttributes::new("career", "goals"),
                },
            ],
        )
        .await
        .unwrap();
    let memobase = harness.memobase(base_config(), ScriptedLlm::new(vec![]));

    let overrides = RetrievalOverrides {
        prefer_topics: Some(vec!["career".to_string()]),
        full_profile_and_only_search_event: Some(true),
        ..Default::default()
    };
    let profiles = memobase.get_relevant_profiles("u1", &[], &overrides).await.unwrap();
    assert_eq!(profiles[0].topic, "career");
}

#[tokio::test]
async fn only_topics_restricts_search_profiles_to_the_whitelist() {
    let harness = Harness::new();
    harness
        .profiles
        .add(
            "u1",
            vec![
                NewProfile {
                    content: "plays jazz guitar".to_string(),
                    attributes: ProfileAttributes::new("hobbies", "music"),
                },
                NewProfile {
                    content: "wants a promotion".to_string(),
                    attributes: ProfileAttributes::new("career", "goals"),
                },
            ],
        )
        .await
        .unwrap();
    let memobase = harness.memobase(base_config(), ScriptedLlm::new(vec![]));

    let topics = vec!["hobbies".to_string()];
    let profiles = memobase.search_profiles("u1", "music", Some(topics.as_slice()), 10).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].topic, "hobbies");
}
