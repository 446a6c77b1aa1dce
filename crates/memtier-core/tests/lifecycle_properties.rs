//! Lifecycle properties: scoring bounds, tier monotonicity, cluster
//! idempotency, retrieval exclusion and scope isolation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use memtier_core::{
    Clustering, ClusteringConfig, MemoryManager, MemtierConfig, PolicyExecutor, Retriever, Scope,
    ScoringEngine, SearchRequest, SimpleSummarizer, SimpleTrimmer, TierConfig, Trimmer,
};
use memtier_store::{
    InMemoryStore, MemoryFilter, MemoryId, MemoryStore, Metadata, NewMemory, SurrealMemoryStore,
};

fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn executor(store: Arc<dyn MemoryStore>, config: MemtierConfig) -> PolicyExecutor {
    PolicyExecutor::new(
        store,
        config,
        Arc::new(SimpleTrimmer),
        Arc::new(SimpleSummarizer),
    )
    .unwrap()
}

fn retriever(store: Arc<dyn MemoryStore>) -> Retriever {
    Retriever::new(store, ScoringEngine::default(), Default::default())
}

// ===========================================================================
// Scoring
// ===========================================================================

#[test]
fn test_score_is_deterministic_and_bounded() {
    let now = fixed_now();
    let engines = [
        ScoringEngine::default(),
        ScoringEngine::default().with_rule_fn(|_| Ok(1e12)),
        ScoringEngine::default().with_rule_fn(|_| Ok(-1e12)),
        ScoringEngine::default()
            .with_rule_fn(|r| Ok(r.content.len() as f64))
            .with_rule_fn(|_| Err(anyhow::anyhow!("rule offline"))),
    ];
    let records: Vec<_> = ["low", "medium", "high", "critical", "bogus"]
        .iter()
        .enumerate()
        .map(|(i, importance)| {
            NewMemory::new("u1", "x".repeat(i * 40))
                .with_metadata(
                    Metadata::new()
                        .with("importance", *importance)
                        .with("seen_count", (i * 7) as i64),
                )
                .into_record(MemoryId(i as u64), now - Duration::days(i as i64 * 20))
        })
        .collect();

    for engine in &engines {
        for record in &records {
            let first = engine.compute(record, now);
            assert!(first <= 100);
            for _ in 0..50 {
                assert_eq!(engine.compute(record, now), first);
            }
        }
    }
}

// ===========================================================================
// Tier migration
// ===========================================================================

fn three_tier_config() -> MemtierConfig {
    let mut config = MemtierConfig::default();
    config.storage.tiers = vec![
        TierConfig::new("hot").with_expiry_days(1),
        TierConfig::new("warm").with_expiry_days(1),
        TierConfig::new("cold"),
    ];
    config.clustering.enabled = false;
    config
}

#[tokio::test]
async fn test_migration_never_skips_a_tier() {
    let store = Arc::new(InMemoryStore::new());
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            store
                .insert(NewMemory::new("u1", format!("m{i}")).with_tier("hot"))
                .await
                .unwrap(),
        );
    }
    store
        .set_updated_at(&ids, Utc::now() - Duration::days(30))
        .await
        .unwrap();

    let exec = executor(store.clone(), three_tier_config());
    let first = exec.run(Some("u1")).await;
    assert_eq!(first.migrated, 5);
    for id in &ids {
        assert_eq!(store.get(*id).await.unwrap().unwrap().tier, "warm");
    }

    // Two days later warm records are due; cold is terminal.
    let later = Utc::now() + Duration::days(2);
    let second = exec.run_at(Some("u1"), later).await;
    assert_eq!(second.migrated, 5);
    for id in &ids {
        assert_eq!(store.get(*id).await.unwrap().unwrap().tier, "cold");
    }

    let third = exec.run_at(Some("u1"), later + Duration::days(30)).await;
    assert_eq!(third.migrated, 0);
    assert_eq!(third.by_tier.get("cold"), Some(&5));
}

async fn expiry_scenario(store: Arc<dyn MemoryStore>) {
    let id = store.insert(NewMemory::new("u1", "stale note")).await.unwrap();
    let fresh = store.insert(NewMemory::new("u1", "fresh note")).await.unwrap();
    store
        .set_updated_at(&[id], Utc::now() - Duration::days(10))
        .await
        .unwrap();

    let summary = executor(store.clone(), MemtierConfig::default())
        .run(None)
        .await;
    assert_eq!(summary.migrated, 1);
    assert!(summary.failed_steps.is_empty(), "{:?}", summary.failed_steps);
    assert_eq!(store.get(id).await.unwrap().unwrap().tier, "mid_term");
    assert_eq!(store.get(fresh).await.unwrap().unwrap().tier, "short_term");
}

#[tokio::test]
async fn test_seven_day_expiry_migrates_once_in_memory() {
    expiry_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_seven_day_expiry_migrates_once_surrealdb() {
    expiry_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_concurrent_runs_for_one_owner_do_not_double_migrate() {
    let store = Arc::new(InMemoryStore::new());
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            store
                .insert(NewMemory::new("u1", format!("m{i}")))
                .await
                .unwrap(),
        );
    }
    store
        .set_updated_at(&ids, Utc::now() - Duration::days(10))
        .await
        .unwrap();

    let exec = Arc::new(executor(store.clone(), MemtierConfig::default()));
    let (a, b) = tokio::join!(exec.run(Some("u1")), exec.run(Some("u1")));
    assert_eq!(a.migrated + b.migrated, 20);
    let counts = store.count_by_tier(Some("u1")).await.unwrap();
    assert_eq!(counts.get("mid_term"), Some(&20));
}

// ===========================================================================
// Thread aggregation
// ===========================================================================

#[tokio::test]
async fn test_thread_aggregate_is_created_once() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..12 {
        store
            .insert(
                NewMemory::new("u1", format!("Step {i} done."))
                    .with_thread("t9")
                    .with_tier("long_term"),
            )
            .await
            .unwrap();
    }
    let mut config = MemtierConfig::default();
    config.clustering.enabled = false;
    let exec = executor(store.clone(), config);

    let first = exec.run(Some("u1")).await;
    assert_eq!(first.thread_summaries, 1);

    let aggregates = store
        .query(
            &MemoryFilter::new()
                .thread("t9")
                .metadata(Metadata::new().with("kind", "thread_summary")),
            10,
        )
        .await
        .unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].tier, "long_term");
    assert!(!aggregates[0].summarized);

    // New members past the threshold are marked, but no second aggregate appears.
    for i in 0..10 {
        store
            .insert(
                NewMemory::new("u1", format!("Later {i}."))
                    .with_thread("t9")
                    .with_tier("long_term"),
            )
            .await
            .unwrap();
    }
    let second = exec.run(Some("u1")).await;
    assert_eq!(second.thread_summaries, 0);
    let live = store
        .query(
            &MemoryFilter::new()
                .thread("t9")
                .summarized(memtier_store::SummarizedFilter::Exclude),
            100,
        )
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert!(live[0].metadata.is_thread_summary());
}

#[tokio::test]
async fn test_short_threads_are_left_alone() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..9 {
        store
            .insert(
                NewMemory::new("u1", format!("m{i}"))
                    .with_thread("t1")
                    .with_tier("long_term"),
            )
            .await
            .unwrap();
    }
    let summary = executor(store.clone(), MemtierConfig::default())
        .run(None)
        .await;
    assert_eq!(summary.thread_summaries, 0);
    assert_eq!(store.len(), 9);
}

// ===========================================================================
// Batch windows
// ===========================================================================

fn small_batch_config() -> MemtierConfig {
    let mut config = MemtierConfig::default();
    config.policies.batch_limit = 10;
    config.clustering.enabled = false;
    config
}

async fn insert_short_notes(store: &dyn MemoryStore, tier: &str, n: usize) {
    for i in 0..n {
        store
            .insert(NewMemory::new("u1", format!("note {i}")).with_tier(tier))
            .await
            .unwrap();
    }
}

async fn summarize_backlog_scenario(store: Arc<dyn MemoryStore>) {
    insert_short_notes(store.as_ref(), "short_term", 10).await;
    let long = store
        .insert(NewMemory::new(
            "u1",
            format!("Decision recorded. {}", "detail ".repeat(200)),
        ))
        .await
        .unwrap();

    let mut config = small_batch_config();
    config.summarization.enabled = true;
    let summary = executor(store.clone(), config).run(Some("u1")).await;

    assert_eq!(summary.summarized, 1);
    let rec = store.get(long).await.unwrap().unwrap();
    assert_eq!(rec.content, "Decision recorded.");
    assert!(rec.summarized);
}

/// Test: short records filling the first window do not hide a long one
/// from the summarize pass
#[tokio::test]
async fn test_summarize_reaches_long_record_behind_short_ones_in_memory() {
    summarize_backlog_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_summarize_reaches_long_record_behind_short_ones_surrealdb() {
    summarize_backlog_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

async fn trim_backlog_scenario(store: Arc<dyn MemoryStore>) {
    insert_short_notes(store.as_ref(), "long_term", 10).await;
    let long = store
        .insert(NewMemory::new("u1", "word ".repeat(400)).with_tier("long_term"))
        .await
        .unwrap();

    let summary = executor(store.clone(), small_batch_config())
        .run(Some("u1"))
        .await;

    assert_eq!(summary.trimmed, 1);
    let rec = store.get(long).await.unwrap().unwrap();
    assert!(rec.content.chars().count() <= 1000);
}

/// Test: trimming only fetches over-long records, so a full window of short
/// ones cannot starve it
#[tokio::test]
async fn test_trim_reaches_long_record_behind_short_ones_in_memory() {
    trim_backlog_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_trim_reaches_long_record_behind_short_ones_surrealdb() {
    trim_backlog_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

/// Leaves records starting with `PIN` untouched.
struct PinAwareTrimmer;

impl Trimmer for PinAwareTrimmer {
    fn trim(&self, text: &str, max_chars: usize) -> String {
        if text.starts_with("PIN") {
            text.to_string()
        } else {
            SimpleTrimmer.trim(text, max_chars)
        }
    }

    fn name(&self) -> &'static str {
        "pin_aware"
    }
}

async fn window_cursor_scenario(store: Arc<dyn MemoryStore>) {
    for _ in 0..10 {
        let pinned = NewMemory::new("u1", format!("PIN {}", "x".repeat(1500)));
        store.insert(pinned.with_tier("long_term")).await.unwrap();
    }
    let long = store
        .insert(NewMemory::new("u1", "word ".repeat(400)).with_tier("long_term"))
        .await
        .unwrap();

    let exec = PolicyExecutor::new(
        store.clone(),
        small_batch_config(),
        Arc::new(PinAwareTrimmer),
        Arc::new(SimpleSummarizer),
    )
    .unwrap();

    assert_eq!(exec.run(Some("u1")).await.trimmed, 0);
    assert_eq!(exec.run(Some("u1")).await.trimmed, 1);
    assert!(store.get(long).await.unwrap().unwrap().content.chars().count() <= 1000);

    // The cursor wrapped: the next run starts over at the pinned records.
    assert_eq!(exec.run(Some("u1")).await.trimmed, 0);
}

/// Test: records the trimmer leaves unchanged do not pin the window; the
/// next run resumes after them
#[tokio::test]
async fn test_window_advances_past_unchanged_records_in_memory() {
    window_cursor_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_window_advances_past_unchanged_records_surrealdb() {
    window_cursor_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

/// Test: an owner-less run visits owners past the first batch_limit
#[tokio::test]
async fn test_owner_fan_out_pages_past_batch_limit() {
    let store = Arc::new(InMemoryStore::new());
    for owner in ["u0", "u1", "u2", "u3", "u4"] {
        for i in 0..10 {
            store
                .insert(
                    NewMemory::new(owner, format!("Step {i} done."))
                        .with_thread("t1")
                        .with_tier("long_term"),
                )
                .await
                .unwrap();
        }
    }

    let mut config = small_batch_config();
    config.policies.batch_limit = 2;
    let summary = executor(store.clone(), config).run(None).await;
    assert_eq!(summary.thread_summaries, 5);
}

/// Test: a single owner with more threads than batch_limit gets every
/// thread aggregated in one run
#[tokio::test]
async fn test_thread_fan_out_pages_past_batch_limit() {
    let store = Arc::new(InMemoryStore::new());
    for thread in ["t1", "t2", "t3"] {
        for i in 0..10 {
            store
                .insert(
                    NewMemory::new("u1", format!("Step {i} done."))
                        .with_thread(thread)
                        .with_tier("long_term"),
                )
                .await
                .unwrap();
        }
    }

    let mut config = small_batch_config();
    config.policies.batch_limit = 2;
    let summary = executor(store.clone(), config).run(Some("u1")).await;
    assert_eq!(summary.thread_summaries, 3);
}

// ===========================================================================
// Clusters
// ===========================================================================

async fn cluster_scenario(store: Arc<dyn MemoryStore>) {
    for i in 0..12 {
        store
            .insert(
                NewMemory::new("u1", format!("invoice question {i}")).with_metadata(
                    Metadata::new()
                        .with("topic", "billing")
                        .with("category", "support"),
                ),
            )
            .await
            .unwrap();
    }
    let clustering = Clustering::new(store.clone(), ClusteringConfig::default());

    assert_eq!(clustering.rebuild("u1").await.unwrap(), 1);
    let first = store.list_clusters("u1", None, 10).await.unwrap();
    assert_eq!(clustering.rebuild("u1").await.unwrap(), 1);
    let second = store.list_clusters("u1", None, 10).await.unwrap();

    assert_eq!(second.len(), 1);
    assert_eq!(second[0].member_count, 12);
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].member_ids, first[0].member_ids);
    assert_eq!(second[0].topic, "billing");
    assert_eq!(second[0].category, "support");
}

#[tokio::test]
async fn test_cluster_rebuild_is_idempotent_in_memory() {
    cluster_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_cluster_rebuild_is_idempotent_surrealdb() {
    cluster_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

// ===========================================================================
// Retrieval
// ===========================================================================

#[tokio::test]
async fn test_summarized_records_are_never_retrieved() {
    let store = Arc::new(InMemoryStore::new());
    let vip = store
        .insert(
            NewMemory::new("u1", "account pin hint")
                .with_thread("t1")
                .with_metadata(Metadata::new().with("importance", "critical")),
        )
        .await
        .unwrap();
    store
        .insert(NewMemory::new("u1", "small talk").with_thread("t1"))
        .await
        .unwrap();
    store.batch_mark_summarized(&[vip]).await.unwrap();

    let r = retriever(store.clone());
    for scope in [Scope::Thread, Scope::User, Scope::Global] {
        let hits = r
            .search(&SearchRequest::for_owner("u1").thread("t1").scope(scope))
            .await
            .unwrap();
        assert!(hits.iter().all(|m| m.record.id != vip), "{scope} leaked");
        assert_eq!(hits.len(), 1);
    }
}

#[tokio::test]
async fn test_thread_and_user_scope_isolation() {
    let store = Arc::new(InMemoryStore::new());
    for (owner, thread) in [("u1", "t1"), ("u1", "t1"), ("u1", "t2"), ("u2", "t1"), ("u2", "t3")] {
        store
            .insert(NewMemory::new(owner, format!("{owner}:{thread}")).with_thread(thread))
            .await
            .unwrap();
    }
    let r = retriever(store);

    let thread = r
        .search(&SearchRequest::for_owner("u1").thread("t1").scope(Scope::Thread))
        .await
        .unwrap();
    assert_eq!(thread.len(), 2);
    assert!(thread
        .iter()
        .all(|m| m.record.owner == "u1" && m.record.thread.as_deref() == Some("t1")));

    let user = r
        .search(&SearchRequest::for_owner("u1").scope(Scope::User))
        .await
        .unwrap();
    assert_eq!(user.len(), 3);
    assert!(user.iter().all(|m| m.record.owner == "u1"));
}

async fn topic_scenario(store: Arc<dyn MemoryStore>) {
    for i in 0..3 {
        store
            .insert(
                NewMemory::new("u1", format!("refund step {i}"))
                    .with_thread("t1")
                    .with_metadata(Metadata::new().with("topic", "refund")),
            )
            .await
            .unwrap();
    }
    store
        .insert(
            NewMemory::new("u2", "someone else's refund")
                .with_thread("t7")
                .with_metadata(Metadata::new().with("topic", "refund")),
        )
        .await
        .unwrap();

    let hits = retriever(store)
        .search(
            &SearchRequest::for_owner("u1")
                .scope(Scope::Topic)
                .metadata(Metadata::new().with("topic", "refund")),
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|m| m.record.owner == "u1"));
}

#[tokio::test]
async fn test_topic_scope_example_in_memory() {
    topic_scenario(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_topic_scope_example_surrealdb() {
    topic_scenario(Arc::new(SurrealMemoryStore::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_topic_scope_spans_threads_sharing_the_topic() {
    let store = Arc::new(InMemoryStore::new());
    for thread in ["t1", "t2"] {
        store
            .insert(
                NewMemory::new("u1", format!("refund in {thread}"))
                    .with_thread(thread)
                    .with_metadata(Metadata::new().with("topic", "refund")),
            )
            .await
            .unwrap();
    }
    store
        .insert(
            NewMemory::new("u1", "shipping")
                .with_thread("t3")
                .with_metadata(Metadata::new().with("topic", "shipping")),
        )
        .await
        .unwrap();

    let hits = retriever(store)
        .search(
            &SearchRequest::for_owner("u1")
                .thread("t1")
                .scope(Scope::Topic)
                .metadata(Metadata::new().with("topic", "refund")),
        )
        .await
        .unwrap();
    let mut threads: Vec<_> = hits
        .iter()
        .filter_map(|m| m.record.thread.clone())
        .collect();
    threads.sort();
    assert_eq!(threads, vec!["t1".to_string(), "t2".to_string()]);
}

#[tokio::test]
async fn test_concurrent_retrievals_agree() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..50 {
        store
            .insert(
                NewMemory::new("u1", format!("m{i}"))
                    .with_thread(format!("t{}", i % 5))
                    .with_metadata(Metadata::new().with(
                        "importance",
                        ["low", "medium", "high", "critical"][i % 4],
                    )),
            )
            .await
            .unwrap();
    }
    let r = Arc::new(retriever(store));
    let now = fixed_now();
    let request = SearchRequest::for_owner("u1").scope(Scope::User).top_k(7);

    let results = futures::future::join_all((0..16).map(|_| {
        let r = r.clone();
        let request = request.clone();
        async move { r.search_at(&request, now).await.unwrap() }
    }))
    .await;

    assert!(results.iter().all(|hits| hits.len() == 7));
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

// ===========================================================================
// Facade
// ===========================================================================

#[tokio::test]
async fn test_manager_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    let manager = MemoryManager::new(store.clone(), MemtierConfig::default()).unwrap();

    for i in 0..3 {
        manager
            .save(
                NewMemory::new("u1", format!("ticket {i}"))
                    .with_thread("t1")
                    .with_metadata(
                        Metadata::new()
                            .with("topic", "Billing")
                            .with("category", "Support"),
                    ),
            )
            .await
            .unwrap();
    }

    let summary = manager.run_policies(Some("u1")).await;
    assert_eq!(summary.clusters, 1);
    assert_eq!(summary.by_tier.get("short_term"), Some(&3));

    let clusters = manager.clusters("u1", Some("billing"), 10).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].member_count, 3);

    let hits = manager
        .recall(&SearchRequest::for_owner("u1").thread("t1"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(manager.metrics().policy_runs(), 1);
    assert_eq!(manager.metrics().clusters_upserted(), 1);
}
