use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsletter_digest::clustering::{ClusteringStatus, DEADLINE_EXCEEDED};
use newsletter_digest::testing::{cluster_reply, is_cluster_prompt, summary_reply, ScriptedModel};
use newsletter_digest::{
    load_raw_emails, CompletionRequest, Digest, DigestEntry, DigestRenderer, DigestStore,
    FailureReason, ItemId, LanguageModel, MemoryDigestStore, ModelError, Normalizer, Pipeline,
    PipelineConfig, PipelineError, RawEmail, RetryPolicy, SqliteDigestStore, StoreError,
    StoredDigest, TimeWindow,
};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, hour, 0, 0).unwrap()
}

fn window() -> TimeWindow {
    TimeWindow::new(at(0), at(23))
}

fn config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        run_timeout: None,
        ..PipelineConfig::default()
    }
}

/// Five records: four newsletters and one without a sender.
fn inbox() -> Vec<RawEmail> {
    let mut missing_sender = RawEmail::new("", "Orphan", at(9), "No one sent this.");
    missing_sender.sender = None;

    vec![
        RawEmail::new(
            "chips@stratechery.com",
            "Chip export controls tighten",
            at(6),
            "The new export rules hit Nvidia hardest.",
        ),
        RawEmail::new(
            "news@axios.com",
            "Washington vs. Nvidia",
            at(7),
            "Congress wants even stricter export controls on GPUs.",
        ),
        missing_sender,
        RawEmail::new(
            "crew@morningbrew.com",
            "Markets rally",
            at(10),
            "Stocks rose on softer inflation data.",
        ),
        RawEmail::new(
            "hello@cooking.com",
            "Sourdough season",
            at(11),
            "Why your starter needs a warmer kitchen.",
        ),
    ]
}

fn subject_of(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Subject: "))
        .unwrap_or("")
        .to_string()
}

/// Summarizes anything and groups items 1 and 2.
fn chip_model() -> Arc<ScriptedModel> {
    Arc::new(ScriptedModel::new(|prompt: &str| {
        if is_cluster_prompt(prompt) {
            Ok(cluster_reply(&[("Chip Export Controls", &[1, 2])]))
        } else {
            let subject = subject_of(prompt);
            Ok(summary_reply(&format!("About {}", subject), &["key point"], &["news"]))
        }
    }))
}

fn entry_ids(digest: &Digest) -> Vec<Vec<u32>> {
    digest
        .entries
        .iter()
        .map(|entry| entry.item_ids().iter().map(|id| id.0).collect())
        .collect()
}

fn hash_of_item(id: u32) -> String {
    let normalized = Normalizer::default().normalize(inbox());
    normalized
        .items
        .into_iter()
        .find(|item| item.id == ItemId(id))
        .map(|item| item.content_hash)
        .unwrap()
}

#[tokio::test]
async fn test_theme_and_standalone_entries() {
    let pipeline = Pipeline::new(config(), chip_model(), Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert_eq!(run.report.records, 5);
    assert_eq!(run.report.items, 4);
    assert_eq!(run.report.rejected.len(), 1);
    assert!(run.report.failures.is_empty());
    assert_eq!(run.report.clustering, ClusteringStatus::Clustered { themes: 1 });

    let digest = &run.digest;
    assert_eq!(entry_ids(digest), vec![vec![1, 2], vec![3], vec![4]]);
    match &digest.entries[0] {
        DigestEntry::Theme { theme, members } => {
            assert_eq!(theme.title, "Chip Export Controls");
            assert_eq!(members[0].summary.gist, "About Chip export controls tighten");
        }
        other => panic!("expected a theme first, got {:?}", other),
    }
    assert!(digest.intro.is_some());
    assert_eq!(digest.user_id, "u1");
    assert_eq!(digest.window(), window());
}

#[tokio::test]
async fn test_previously_delivered_item_breaks_theme() {
    let store = Arc::new(MemoryDigestStore::new());
    let hash = hash_of_item(2);
    store
        .record_delivered("u1", TimeWindow::new(at(0), at(8)), &[hash.as_str()])
        .unwrap();
    let pipeline = Pipeline::new(config(), chip_model(), store);

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert_eq!(entry_ids(&run.digest), vec![vec![1], vec![3], vec![4]]);
    assert!(run.digest.entries.iter().all(|e| !e.is_theme()));
    assert_eq!(run.report.excluded_hashes, BTreeSet::from([hash]));
}

#[tokio::test]
async fn test_same_input_same_digest() {
    let first = Pipeline::new(config(), chip_model(), Arc::new(MemoryDigestStore::new()))
        .run_pipeline("u1", window(), inbox())
        .await
        .unwrap();
    let second = Pipeline::new(config(), chip_model(), Arc::new(MemoryDigestStore::new()))
        .run_pipeline("u1", window(), inbox())
        .await
        .unwrap();

    assert_eq!(first.digest.entries, second.digest.entries);
    assert_eq!(first.digest.intro, second.digest.intro);
}

#[tokio::test]
async fn test_saved_digest_not_repeated_in_overlapping_window() {
    let store = Arc::new(SqliteDigestStore::open_in_memory().unwrap());
    let pipeline = Pipeline::new(config(), chip_model(), store.clone());

    let first = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();
    store.save_digest(&first.digest).unwrap();

    let overlapping = TimeWindow::new(at(12), Utc.with_ymd_and_hms(2026, 2, 2, 12, 0, 0).unwrap());
    let second = pipeline.run_pipeline("u1", overlapping, inbox()).await.unwrap();

    assert!(second.digest.is_empty());
    assert!(second.digest.intro.is_none());
    assert_eq!(second.report.excluded_hashes.len(), 4);

    // Another user still gets everything.
    let other = pipeline.run_pipeline("u2", overlapping, inbox()).await.unwrap();
    assert_eq!(other.digest.item_count(), 4);

    // Nothing delivered earlier shows up again for u1.
    let delivered: HashSet<String> = first.digest.content_hashes().into_iter().collect();
    assert!(second
        .digest
        .content_hashes()
        .iter()
        .all(|hash| !delivered.contains(hash)));
}

#[tokio::test]
async fn test_clustering_failure_keeps_every_item() {
    let model = Arc::new(ScriptedModel::new(|prompt: &str| {
        if is_cluster_prompt(prompt) {
            Err(ModelError::Api {
                status: 529,
                message: "overloaded".to_string(),
            })
        } else {
            Ok(summary_reply("gist", &["point"], &[]))
        }
    }));
    let pipeline = Pipeline::new(config(), model, Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert_eq!(run.digest.theme_count(), 0);
    assert_eq!(entry_ids(&run.digest), vec![vec![1], vec![2], vec![3], vec![4]]);
    assert!(matches!(run.report.clustering, ClusteringStatus::Degraded { .. }));
    assert!(run.report.is_degraded());
    assert!(run.digest.intro.is_none());
}

#[tokio::test]
async fn test_failed_items_reported_not_dropped() {
    let model = Arc::new(ScriptedModel::new(|prompt: &str| {
        if is_cluster_prompt(prompt) {
            Ok(cluster_reply(&[("Chip Export Controls", &[1, 2])]))
        } else if subject_of(prompt) == "Washington vs. Nvidia" {
            Err(ModelError::Api {
                status: 413,
                message: "request too large".to_string(),
            })
        } else {
            Ok(summary_reply("gist", &["point"], &[]))
        }
    }));
    let pipeline = Pipeline::new(config(), model.clone(), Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert_eq!(run.report.failures.len(), 1);
    assert_eq!(run.report.failures[0].item_id, ItemId(2));
    assert!(matches!(run.report.failures[0].reason, FailureReason::Rejected { .. }));

    // The clusterer never sees the failed item, so the proposed pair collapses.
    assert_eq!(run.digest.theme_count(), 0);
    assert!(!model.calls().last().unwrap().contains("\"id\": 2"));

    // Every item is either in the digest or in the failure list.
    let mut accounted: Vec<u32> = run
        .digest
        .entries
        .iter()
        .flat_map(|e| e.item_ids())
        .chain(run.report.failures.iter().map(|f| f.item_id))
        .map(|id| id.0)
        .collect();
    accounted.sort();
    assert_eq!(accounted, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_themes_stay_valid_with_noisy_clustering() {
    let model = Arc::new(ScriptedModel::new(|prompt: &str| {
        if is_cluster_prompt(prompt) {
            Ok(cluster_reply(&[
                ("Everything", &[1, 2, 3, 4, 99]),
                ("Again", &[3, 4]),
                ("Lonely", &[2]),
            ]))
        } else {
            Ok(summary_reply("gist", &["point"], &[]))
        }
    }));
    let pipeline = Pipeline::new(config(), model, Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert_eq!(entry_ids(&run.digest), vec![vec![1, 2, 3, 4]]);
    let mut seen = HashSet::new();
    for entry in &run.digest.entries {
        if let DigestEntry::Theme { theme, members } = entry {
            assert!(members.len() >= 2);
            assert_eq!(theme.member_item_ids.len(), members.len());
        }
        for id in entry.item_ids() {
            assert!(seen.insert(id));
        }
    }
}

#[tokio::test]
async fn test_no_usable_input_is_fatal() {
    let model = chip_model();
    let pipeline = Pipeline::new(config(), model.clone(), Arc::new(MemoryDigestStore::new()));

    let mut bodiless = RawEmail::new("a@example.com", "Empty", at(5), "");
    bodiless.body = None;
    let result = pipeline
        .run_pipeline("u1", window(), vec![bodiless, RawEmail::new("b@example.com", "Blank", at(6), "  \n ")])
        .await;

    match result {
        Err(PipelineError::NoInput { rejected }) => assert_eq!(rejected.len(), 2),
        other => panic!("expected NoInput, got {:?}", other.map(|run| run.digest)),
    }

    let empty = pipeline.run_pipeline("u1", window(), Vec::new()).await;
    assert!(matches!(empty, Err(PipelineError::NoInput { .. })));
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn test_authentication_failure_aborts_run() {
    let model = Arc::new(ScriptedModel::new(|_: &str| {
        Err(ModelError::Authentication("invalid x-api-key".to_string()))
    }));
    let pipeline = Pipeline::new(config(), model, Arc::new(MemoryDigestStore::new()));

    let result = pipeline.run_pipeline("u1", window(), inbox()).await;

    assert!(matches!(
        result,
        Err(PipelineError::Model(ModelError::Authentication(_)))
    ));
}

struct BrokenStore;

impl DigestStore for BrokenStore {
    fn find_content_hashes_in_overlapping_window(
        &self,
        _user_id: &str,
        _window: &TimeWindow,
    ) -> Result<HashSet<String>, StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk unavailable",
        )))
    }

    fn save_digest(&self, _digest: &Digest) -> Result<i64, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn recent_digests(&self, _user_id: &str, _limit: usize) -> Result<Vec<StoredDigest>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_store_failure_is_fatal() {
    let pipeline = Pipeline::new(config(), chip_model(), Arc::new(BrokenStore));

    let result = pipeline.run_pipeline("u1", window(), inbox()).await;

    assert!(matches!(result, Err(PipelineError::Store(StoreError::Io(_)))));
}

#[tokio::test]
async fn test_run_deadline_fails_slow_items_and_continues() {
    let model = Arc::new(
        ScriptedModel::new(|prompt: &str| {
            if is_cluster_prompt(prompt) {
                Ok(cluster_reply(&[]))
            } else {
                Ok(summary_reply("gist", &["point"], &[]))
            }
        })
        .with_delay(Duration::from_millis(300)),
    );
    let pipeline = Pipeline::new(
        PipelineConfig {
            run_timeout: Some(Duration::from_millis(20)),
            ..config()
        },
        model,
        Arc::new(MemoryDigestStore::new()),
    );

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert!(run.digest.is_empty());
    assert_eq!(run.report.failures.len(), 4);
    assert!(run
        .report
        .failures
        .iter()
        .all(|f| f.reason == FailureReason::DeadlineExceeded));
    assert_eq!(run.report.clustering, ClusteringStatus::Skipped);
}

#[tokio::test]
async fn test_duplicate_emails_summarized_once() {
    let model = chip_model();
    let pipeline = Pipeline::new(config(), model.clone(), Arc::new(MemoryDigestStore::new()));
    let mut records = inbox();
    records.push(RawEmail::new(
        "news@axios.com",
        "Washington vs. Nvidia",
        at(12),
        "Congress wants even stricter export controls on GPUs!",
    ));

    let run = pipeline.run_pipeline("u1", window(), records).await.unwrap();

    assert_eq!(run.report.duplicates, 1);
    assert_eq!(run.digest.item_count(), 4);
    // Four summaries plus one clustering call.
    assert_eq!(model.call_count(), 5);
}

/// Answers summaries at once and takes its time over clustering.
struct SlowClusterModel {
    cluster_delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowClusterModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        if is_cluster_prompt(&request.prompt) {
            tokio::time::sleep(self.cluster_delay).await;
            Ok(cluster_reply(&[("Chip Export Controls", &[1, 2])]))
        } else {
            Ok(summary_reply("gist", &["point"], &[]))
        }
    }
}

#[tokio::test]
async fn test_run_deadline_cuts_off_slow_clustering() {
    let pipeline = Pipeline::new(
        PipelineConfig {
            run_timeout: Some(Duration::from_millis(300)),
            ..config()
        },
        Arc::new(SlowClusterModel {
            cluster_delay: Duration::from_secs(10),
        }),
        Arc::new(MemoryDigestStore::new()),
    );
    let started = Instant::now();

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(run.report.failures.is_empty());
    assert_eq!(
        run.report.clustering,
        ClusteringStatus::Degraded {
            reason: DEADLINE_EXCEEDED.to_string()
        }
    );
    assert_eq!(entry_ids(&run.digest), vec![vec![1], vec![2], vec![3], vec![4]]);
    assert!(run.report.is_degraded());
}

#[tokio::test]
async fn test_bad_records_in_input_file_do_not_sink_the_run() {
    let dir = std::env::temp_dir().join(format!("newsletter-digest-run-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("inbox.json");
    std::fs::write(
        &path,
        json!([
            {
                "sender_email": "chips@stratechery.com",
                "subject": "Chip export controls tighten",
                "received_at": "2026-02-01T06:00:00Z",
                "body": "The new export rules hit Nvidia hardest."
            },
            {
                "sender_email": "news@axios.com",
                "subject": "Undated",
                "body": "This one lost its date."
            },
            {
                "sender_email": "crew@morningbrew.com",
                "subject": "Markets rally",
                "received_at": "2026-02-01T10:00:00Z",
                "body": "Stocks rose on softer inflation data."
            }
        ])
        .to_string(),
    )
    .unwrap();

    let loaded = load_raw_emails(&path).unwrap();
    let model = chip_model();
    let pipeline = Pipeline::new(config(), model, Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_loaded("u1", window(), loaded).await.unwrap();

    assert_eq!(run.report.records, 3);
    assert_eq!(run.report.items, 2);
    assert_eq!(run.report.rejected.len(), 1);
    assert!(run.report.rejected[0].starts_with("record 1: malformed:"));
    assert!(run.report.rejected[0].contains("received_at"));
    assert_eq!(run.digest.item_count(), 2);
}

#[tokio::test]
async fn test_top_story_and_disagreements_reach_the_digest() {
    let model = Arc::new(ScriptedModel::new(|prompt: &str| {
        if is_cluster_prompt(prompt) {
            Ok(json!({
                "intro": "Chips led the day.",
                "top_story": {
                    "title": "Export Rules Tighten",
                    "why": "Washington moved again on GPUs.",
                    "sources": ["Stratechery", "Axios"]
                },
                "themes": [{
                    "title": "Chip Export Controls",
                    "item_ids": [1, 2],
                    "rationale": "Both cover the new rules.",
                    "synthesis": "Two takes on the same crackdown.",
                    "importance": 9
                }],
                "contradictions": [{
                    "topic": "Do the rules work?",
                    "positions": [
                        {"source": "Stratechery", "position": "They backfire."},
                        {"source": "Axios", "position": "Congress wants more."}
                    ]
                }]
            })
            .to_string())
        } else {
            Ok(summary_reply("gist", &["point"], &[]))
        }
    }));
    let pipeline = Pipeline::new(config(), model, Arc::new(MemoryDigestStore::new()));

    let run = pipeline.run_pipeline("u1", window(), inbox()).await.unwrap();

    let digest = &run.digest;
    assert_eq!(
        digest.top_story.as_ref().map(|story| story.title.as_str()),
        Some("Export Rules Tighten")
    );
    assert_eq!(digest.contradictions.len(), 1);
    match &digest.entries[0] {
        DigestEntry::Theme { theme, .. } => {
            assert_eq!(theme.synthesis, "Two takes on the same crackdown.");
            assert_eq!(theme.importance, Some(9));
        }
        other => panic!("expected a theme first, got {:?}", other),
    }

    let text = DigestRenderer::plain_text(digest);
    assert!(text.contains("TOP STORY"));
    assert!(text.contains("  Axios: Congress wants more."));

    let saved: Digest = serde_json::from_str(&serde_json::to_string(digest).unwrap()).unwrap();
    assert_eq!(&saved, digest);
}
