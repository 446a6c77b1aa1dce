//! Contract tests for MemoryStore.
//!
//! Each contract is written once against `&dyn MemoryStore` and run against
//! both the in-memory fake and the SurrealDB backend (`mem://`).

use chrono::{Duration, Utc};
use memtier_store::{
    ClusterUpsert, InMemoryStore, MemoryFilter, MemoryId, MemoryStore, Metadata, NewMemory,
    StorageError, SummarizedFilter, SurrealMemoryStore, DEFAULT_TIER,
};

async fn surreal() -> SurrealMemoryStore {
    SurrealMemoryStore::in_memory().await.unwrap()
}

macro_rules! contract {
    ($name:ident) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn in_memory() {
                super::$name(&InMemoryStore::new()).await;
            }

            #[tokio::test]
            async fn surrealdb() {
                super::$name(&surreal().await).await;
            }
        }
    };
}

fn topic(t: &str) -> Metadata {
    Metadata::new().with("topic", t)
}

// ===========================================================================
// Insert / get / query
// ===========================================================================

async fn insert_assigns_increasing_ids_and_defaults(store: &dyn MemoryStore) {
    let a = store.insert(NewMemory::new("u1", "first")).await.unwrap();
    let b = store
        .insert(NewMemory::new("u1", "second").with_tier("long_term").with_score(70))
        .await
        .unwrap();
    assert!(b > a);

    let rec = store.get(a).await.unwrap().expect("record a");
    assert_eq!(rec.tier, DEFAULT_TIER);
    assert!(!rec.summarized);
    assert_eq!(rec.created_at, rec.updated_at);

    let rec = store.get(b).await.unwrap().expect("record b");
    assert_eq!(rec.tier, "long_term");
    assert_eq!(rec.score, Some(70));

    assert!(store.get(MemoryId(9_999)).await.unwrap().is_none());
}
contract!(insert_assigns_increasing_ids_and_defaults);

async fn query_filters_by_owner_thread_and_metadata(store: &dyn MemoryStore) {
    let a = store
        .insert(NewMemory::new("u1", "a").with_thread("t1").with_metadata(topic("refund")))
        .await
        .unwrap();
    let b = store
        .insert(NewMemory::new("u1", "b").with_thread("t2").with_metadata(topic("refund")))
        .await
        .unwrap();
    store
        .insert(NewMemory::new("u1", "c").with_thread("t1").with_metadata(topic("billing")))
        .await
        .unwrap();
    store
        .insert(NewMemory::new("u2", "d").with_thread("t1").with_metadata(topic("refund")))
        .await
        .unwrap();

    let by_thread = store
        .query(&MemoryFilter::new().owner("u1").thread("t1"), 100)
        .await
        .unwrap();
    assert_eq!(by_thread.len(), 2);
    assert!(by_thread.iter().all(|r| r.owner == "u1"));

    let by_topic = store
        .query(&MemoryFilter::new().owner("u1").metadata(topic("refund")), 100)
        .await
        .unwrap();
    let ids: Vec<MemoryId> = by_topic.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a, b]);

    let in_set = store
        .query(
            &MemoryFilter::new()
                .owner("u1")
                .threads_any_of(vec!["t2".into(), "t9".into()]),
            100,
        )
        .await
        .unwrap();
    assert_eq!(in_set.len(), 1);
    assert_eq!(in_set[0].id, b);
}
contract!(query_filters_by_owner_thread_and_metadata);

async fn query_respects_limit_and_id_order(store: &dyn MemoryStore) {
    for i in 0..5 {
        store
            .insert(NewMemory::new("u1", format!("m{i}")))
            .await
            .unwrap();
    }
    let rows = store.query(&MemoryFilter::new(), 3).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(rows[0].content, "m0");
}
contract!(query_respects_limit_and_id_order);

// ===========================================================================
// Batch updates
// ===========================================================================

async fn mark_summarized_excludes_from_default_queries(store: &dyn MemoryStore) {
    let a = store.insert(NewMemory::new("u1", "a")).await.unwrap();
    let b = store.insert(NewMemory::new("u1", "b")).await.unwrap();

    assert_eq!(store.batch_mark_summarized(&[a]).await.unwrap(), 1);

    let live = store
        .query(&MemoryFilter::new().summarized(SummarizedFilter::Exclude), 100)
        .await
        .unwrap();
    assert_eq!(live.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);

    let done = store
        .query(&MemoryFilter::new().summarized(SummarizedFilter::Only), 100)
        .await
        .unwrap();
    assert_eq!(done.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a]);
}
contract!(mark_summarized_excludes_from_default_queries);

async fn tier_update_bumps_updated_at(store: &dyn MemoryStore) {
    let id = store.insert(NewMemory::new("u1", "a")).await.unwrap();
    let old = Utc::now() - Duration::days(10);
    assert_eq!(store.set_updated_at(&[id], old).await.unwrap(), 1);

    let stale = store
        .query(
            &MemoryFilter::new().updated_before(Utc::now() - Duration::days(7)),
            100,
        )
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);

    assert_eq!(store.batch_update_tier(&[id], "mid_term").await.unwrap(), 1);
    let rec = store.get(id).await.unwrap().unwrap();
    assert_eq!(rec.tier, "mid_term");
    assert!(rec.updated_at > old + Duration::days(9));
}
contract!(tier_update_bumps_updated_at);

async fn update_content_replaces_text(store: &dyn MemoryStore) {
    let id = store.insert(NewMemory::new("u1", "long text")).await.unwrap();
    assert_eq!(store.update_content(id, "short").await.unwrap(), 1);
    assert_eq!(store.get(id).await.unwrap().unwrap().content, "short");
    assert_eq!(store.update_content(MemoryId(4_242), "x").await.unwrap(), 0);
}
contract!(update_content_replaces_text);

async fn empty_batches_touch_nothing(store: &dyn MemoryStore) {
    store.insert(NewMemory::new("u1", "a")).await.unwrap();
    assert_eq!(store.batch_update_tier(&[], "mid_term").await.unwrap(), 0);
    assert_eq!(store.batch_mark_summarized(&[]).await.unwrap(), 0);
}
contract!(empty_batches_touch_nothing);

// ===========================================================================
// Clusters
// ===========================================================================

async fn cluster_upsert_is_idempotent_per_key(store: &dyn MemoryStore) {
    let first = ClusterUpsert {
        owner: "u1".into(),
        topic: "billing".into(),
        category: "support".into(),
        member_ids: vec![MemoryId(1), MemoryId(2)],
        summary: "two".into(),
    };
    let id1 = store.upsert_cluster(&first).await.unwrap();

    let second = ClusterUpsert {
        member_ids: vec![MemoryId(1), MemoryId(2), MemoryId(3)],
        summary: "three".into(),
        ..first.clone()
    };
    let id2 = store.upsert_cluster(&second).await.unwrap();
    assert_eq!(id1, id2);

    let rows = store.list_clusters("u1", None, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].member_count, 3);
    assert_eq!(rows[0].summary, "three");
    assert_eq!(rows[0].member_ids, second.member_ids);

    let other = ClusterUpsert {
        owner: "u2".into(),
        ..first
    };
    let id3 = store.upsert_cluster(&other).await.unwrap();
    assert_ne!(id1, id3);
    assert_eq!(store.list_clusters("u1", Some("billing"), 10).await.unwrap().len(), 1);
    assert!(store.list_clusters("u1", Some("refund"), 10).await.unwrap().is_empty());
}
contract!(cluster_upsert_is_idempotent_per_key);

// ===========================================================================
// Listings and counts
// ===========================================================================

async fn thread_and_owner_listings(store: &dyn MemoryStore) {
    store
        .insert(NewMemory::new("u1", "a").with_thread("t2").with_metadata(topic("refund")))
        .await
        .unwrap();
    store
        .insert(NewMemory::new("u1", "b").with_thread("t1").with_tier("long_term"))
        .await
        .unwrap();
    store.insert(NewMemory::new("u1", "c")).await.unwrap();
    store
        .insert(NewMemory::new("u2", "d").with_thread("t3").with_metadata(topic("refund")))
        .await
        .unwrap();

    assert_eq!(
        store.distinct_threads(Some("u1"), None, None, 10).await.unwrap(),
        vec!["t1".to_string(), "t2".to_string()]
    );
    assert_eq!(
        store
            .distinct_threads(Some("u1"), Some("long_term"), None, 10)
            .await
            .unwrap(),
        vec!["t1".to_string()]
    );
    assert_eq!(store.distinct_threads(None, None, None, 10).await.unwrap().len(), 3);
    assert_eq!(
        store.threads_by_topic("u1", "refund", 10).await.unwrap(),
        vec!["t2".to_string()]
    );
    assert_eq!(
        store.distinct_owners(None, 10).await.unwrap(),
        vec!["u1".to_string(), "u2".to_string()]
    );

    let counts = store.count_by_tier(Some("u1")).await.unwrap();
    assert_eq!(counts.get(DEFAULT_TIER), Some(&2));
    assert_eq!(counts.get("long_term"), Some(&1));
    let all = store.count_by_tier(None).await.unwrap();
    assert_eq!(all.values().sum::<usize>(), 4);
}
contract!(thread_and_owner_listings);

async fn listings_page_after_a_cursor(store: &dyn MemoryStore) {
    let rows = [("u1", "t1"), ("u1", "t2"), ("u1", "t3"), ("u2", "t4"), ("u3", "t5")];
    for (owner, thread) in rows {
        store
            .insert(NewMemory::new(owner, "x").with_thread(thread))
            .await
            .unwrap();
    }

    assert_eq!(
        store.distinct_owners(None, 2).await.unwrap(),
        vec!["u1".to_string(), "u2".to_string()]
    );
    assert_eq!(
        store.distinct_owners(Some("u2"), 2).await.unwrap(),
        vec!["u3".to_string()]
    );
    assert!(store.distinct_owners(Some("u3"), 2).await.unwrap().is_empty());

    assert_eq!(
        store
            .distinct_threads(Some("u1"), None, Some("t1"), 10)
            .await
            .unwrap(),
        vec!["t2".to_string(), "t3".to_string()]
    );
}
contract!(listings_page_after_a_cursor);

async fn min_chars_is_applied_before_the_limit(store: &dyn MemoryStore) {
    for _ in 0..5 {
        store.insert(NewMemory::new("u1", "short")).await.unwrap();
    }
    let long = store
        .insert(NewMemory::new("u1", "é".repeat(40)))
        .await
        .unwrap();

    let hits = store
        .query(&MemoryFilter::new().owner("u1").min_chars(40), 3)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, long);
    assert!(store
        .query(&MemoryFilter::new().min_chars(41), 10)
        .await
        .unwrap()
        .is_empty());
}
contract!(min_chars_is_applied_before_the_limit);

async fn after_id_resumes_past_a_window(store: &dyn MemoryStore) {
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(store.insert(NewMemory::new("u1", format!("m{i}"))).await.unwrap());
    }
    let rest = store
        .query(&MemoryFilter::new().after_id(ids[1]), 10)
        .await
        .unwrap();
    assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), ids[2..].to_vec());
}
contract!(after_id_resumes_past_a_window);

// ===========================================================================
// Backend-specific
// ===========================================================================

#[tokio::test]
async fn surreal_rejects_unsafe_metadata_keys() {
    let store = surreal().await;
    let filter = MemoryFilter::new().metadata(Metadata::new().with("a.b", "x"));
    let err = store.query(&filter, 10).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidFilter { .. }));
}

#[tokio::test]
async fn in_memory_accepts_any_metadata_key() {
    let store = InMemoryStore::new();
    store
        .insert(NewMemory::new("u1", "a").with_metadata(Metadata::new().with("a.b", "x")))
        .await
        .unwrap();
    let filter = MemoryFilter::new().metadata(Metadata::new().with("a.b", "x"));
    assert_eq!(store.query(&filter, 10).await.unwrap().len(), 1);
}
