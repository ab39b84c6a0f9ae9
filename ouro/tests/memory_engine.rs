//! Memory engine: write path, keyword recall, records, anomalies, code index.

mod init_logging;

use std::time::Duration;

use ouro::memory::{
    CodeIndexOutcome, Decision, MemoryEngine, Metric, Pattern, ThresholdPolicy,
};
use ouro::message::{Message, Role};

fn engine(dir: &std::path::Path) -> MemoryEngine {
    MemoryEngine::open_at(dir.join("memory.db"), dir.join("conversations"), 1000).unwrap()
}

/// **Scenario**: two messages land in the log in order and keyword search
/// finds each by its own terms with a positive score.
#[tokio::test]
async fn conversation_write_and_keyword_recall() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    m.store_message("C1", &Message::user("optimize the authentication module"))
        .await
        .unwrap();
    m.store_message(
        "C1",
        &Message::assistant(
            "Here are three options: memoization, caching, and connection pooling.",
        ),
    )
    .await
    .unwrap();

    let log_path = dir.path().join("conversations/C1.jsonl");
    let content = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("optimize the authentication module"));
    assert!(lines[1].contains("connection pooling"));

    let hits = m.search_conversations("authentication", 10).await.unwrap().hits;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].score > 0.0);
    assert!(hits[0].content.starts_with("user:"));

    let hits = m.search_conversations("pooling", 10).await.unwrap().hits;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.starts_with("assistant:"));
}

/// **Scenario**: the stored mirror is byte-identical to the log for content
/// and ids are deterministic per ordinal.
#[tokio::test]
async fn stored_mirror_matches_log() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    let stored = m.store_message("C2", &Message::user("hello there")).await.unwrap();
    assert_eq!(stored.id, "msg_C2_0");

    let from_log = m.read_log("C2").await.unwrap();
    let from_store = m.list_messages("C2", 10).await.unwrap();
    assert_eq!(from_log.len(), 1);
    assert_eq!(from_store.len(), 1);
    assert_eq!(from_log[0].content, from_store[0].content);
    assert_eq!(from_store[0].role, Role::User);

    let conv = m.get_conversation("C2").await.unwrap().unwrap();
    assert_eq!(conv.id, "C2");
}

/// **Scenario**: invalid conversation ids are refused before any write.
#[tokio::test]
async fn invalid_ids_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());
    for bad in ["../sneaky", "a/b", ""] {
        assert!(m.store_message(bad, &Message::user("x")).await.is_err());
    }
}

/// **Scenario**: decisions are searchable and outcomes append later.
#[tokio::test]
async fn decisions_record_and_search() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    let decision = Decision {
        id: "d1".into(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        context: "repeated dispatcher failures against provider A".into(),
        reasoning: "cooldown beats immediate retry under auth errors".into(),
        alternatives: vec!["retry immediately".into(), "drop provider".into()],
        chosen: "rotate keys with cooldown".into(),
        outcome: None,
        lessons: None,
    };
    m.record_decision(&decision).await.unwrap();

    let hits = m.search_decisions("cooldown", 10).await.unwrap().hits;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "d1");

    m.record_decision_outcome("d1", "auth errors stopped recurring", Some("rotate early"))
        .await
        .unwrap();
}

/// **Scenario**: pattern outcome feedback bumps the right counter.
#[tokio::test]
async fn pattern_feedback_updates_counts() {
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    m.upsert_pattern(&Pattern {
        id: "p1".into(),
        name: "staged swap".into(),
        category: "deploy".into(),
        problem: "partial writes during promotion".into(),
        solution: "stage to temp dir then rename".into(),
        success_count: 0,
        failure_count: 0,
    })
    .await
    .unwrap();

    m.pattern_feedback("p1", true).await.unwrap();
    m.pattern_feedback("p1", true).await.unwrap();
    m.pattern_feedback("p1", false).await.unwrap();

    let p = m.get_pattern("p1").await.unwrap().unwrap();
    assert_eq!(p.success_count, 2);
    assert_eq!(p.failure_count, 1);
}

/// **Scenario**: the absolute policy flags spikes; std_deviation of a
/// constant series is empty (zero sigma handled).
#[tokio::test]
async fn anomaly_policies_over_recorded_metrics() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    for value in [10.0, 11.0, 9.0, 500.0] {
        m.record_metric(&Metric::now("latency", "llm_call", value))
            .await
            .unwrap();
    }
    let anomalies = m
        .detect_anomalies(
            "latency",
            Duration::from_secs(3600),
            &ThresholdPolicy::Absolute { threshold: 100.0 },
        )
        .await
        .unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].value, 500.0);

    for _ in 0..5 {
        m.record_metric(&Metric::now("constant", "steady", 7.0)).await.unwrap();
    }
    let anomalies = m
        .detect_anomalies(
            "constant",
            Duration::from_secs(3600),
            &ThresholdPolicy::std_deviation_default(),
        )
        .await
        .unwrap();
    assert!(anomalies.is_empty());
}

/// **Scenario**: code indexing is incremental. Unchanged files are a no-op,
/// a changed file rewrites only its chunks, and code search finds symbols.
#[tokio::test]
async fn code_index_is_incremental() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let m = engine(dir.path());

    let v1 = "use std::fs;\n\npub fn rotate_keys() {\n    // round robin\n}\n";
    let first = m
        .index_code_file("agent", "src/keys.rs", "rust", v1)
        .await
        .unwrap();
    assert!(matches!(first, CodeIndexOutcome::Indexed { .. }));

    assert_eq!(
        m.index_code_file("agent", "src/keys.rs", "rust", v1).await.unwrap(),
        CodeIndexOutcome::Unchanged
    );

    let hits = m.search_code("rotate_keys", 10).await.unwrap().hits;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata["file_path"], "src/keys.rs");

    let v2 = "use std::fs;\n\npub fn rotate_keys_with_cooldown() {\n}\n";
    let second = m
        .index_code_file("agent", "src/keys.rs", "rust", v2)
        .await
        .unwrap();
    match second {
        CodeIndexOutcome::Indexed { chunks_written, .. } => assert!(chunks_written > 0),
        other => panic!("expected reindex, got {other:?}"),
    }
    assert!(m.search_code("rotate_keys_with_cooldown", 10).await.unwrap().hits.len() == 1);
}
