use chrono::Utc;
use pagewright::ingest::IngestOutcome;

mod common;
use common::*;

const FIRST_URL: &str = "https://example.com/rust-post";
const SECOND_URL: &str = "https://example.com/tokio-post";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_topic_digests_accumulate_and_replay_is_idempotent() {
    let rig = engine_with(&prose_article(80)).await;

    // Page one: classification, then a seed summary.
    rig.model.push_completion(
        r#"{"topics": [{"key": "async-runtimes", "score": 0.6, "reason": "main subject"}]}"#,
    );
    rig.model
        .push_completion(r#"{"title": "Async digest", "text": "First page summary."}"#);
    let outcome = rig
        .engine
        .ingest_now("user-9", FIRST_URL)
        .await
        .expect("first ingest");
    assert!(matches!(outcome, IngestOutcome::Indexed { .. }));

    // Page two lands in the same bucket through a merge.
    rig.model
        .push_completion(r#"{"topics": [{"key": "async-runtimes", "score": 0.3}]}"#);
    rig.model
        .push_completion(r#"{"title": "Async digest", "text": "Both pages summarized."}"#);
    rig.engine
        .ingest_now("user-9", SECOND_URL)
        .await
        .expect("second ingest");

    let today = Utc::now().date_naive();
    let digest = rig
        .engine
        .digest("user-9", today, "async-runtimes")
        .await
        .expect("digest query")
        .expect("bucket exists");
    assert_eq!(digest.resource_ids.len(), 2);
    assert_eq!(digest.content.text, "Both pages summarized.");

    let prefs = rig
        .engine
        .topic_preferences("user-9")
        .await
        .expect("preferences");
    assert_eq!(prefs.len(), 1);
    assert_eq!(prefs[0].topic_key, "async-runtimes");
    assert!((prefs[0].score - 0.9).abs() < 1e-9);

    // Replaying page one classifies again but contributes nothing new.
    rig.model
        .push_completion(r#"{"topics": [{"key": "async-runtimes", "score": 0.6}]}"#);
    rig.engine
        .ingest_now("user-9", FIRST_URL)
        .await
        .expect("replay ingest");

    let digest = rig
        .engine
        .digest("user-9", today, "async-runtimes")
        .await
        .expect("digest query")
        .expect("bucket exists");
    assert_eq!(digest.resource_ids.len(), 2, "replayed resource is not re-counted");
    assert_eq!(digest.content.text, "Both pages summarized.");

    let prefs = rig
        .engine
        .topic_preferences("user-9")
        .await
        .expect("preferences");
    assert!(
        (prefs[0].score - 0.9).abs() < 1e-9,
        "replay leaves the preference score alone"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unclassified_pages_leave_no_digest() {
    let rig = engine_with(&prose_article(60)).await;

    // No scripted completions: classification fails and is tolerated.
    rig.engine
        .ingest_now("user-3", FIRST_URL)
        .await
        .expect("ingest succeeds without enrichment");

    let today = Utc::now().date_naive();
    let digest = rig
        .engine
        .digest("user-3", today, "async-runtimes")
        .await
        .expect("digest query");
    assert!(digest.is_none());

    let prefs = rig
        .engine
        .topic_preferences("user-3")
        .await
        .expect("preferences");
    assert!(prefs.is_empty());
}
