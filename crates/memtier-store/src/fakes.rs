//! In-memory implementation of the storage contract
//!
//! `InMemoryStore` satisfies every `MemoryStore` guarantee without any
//! external dependency. It backs the engine's tests and small embedded
//! deployments that do not need persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::metadata::KEY_TOPIC;
use crate::storage_traits::*;

type ClusterKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    memories: BTreeMap<MemoryId, MemoryRecord>,
    clusters: HashMap<ClusterKey, ClusterRecord>,
}

/// In-memory store backed by a `BTreeMap<MemoryId, MemoryRecord>`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
    }

    /// Number of stored memories (all owners, all tiers).
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.memories.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn update_each<F>(state: &mut State, ids: &[MemoryId], mut f: F) -> usize
where
    F: FnMut(&mut MemoryRecord),
{
    let unique: BTreeSet<MemoryId> = ids.iter().copied().collect();
    let mut affected = 0;
    for id in unique {
        if let Some(rec) = state.memories.get_mut(&id) {
            f(rec);
            affected += 1;
        }
    }
    affected
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert(&self, memory: NewMemory) -> StorageResult<MemoryId> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = MemoryId(state.next_id);
        state.memories.insert(id, memory.into_record(id, Utc::now()));
        Ok(id)
    }

    async fn get(&self, id: MemoryId) -> StorageResult<Option<MemoryRecord>> {
        let state = self.lock()?;
        Ok(state.memories.get(&id).cloned())
    }

    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryRecord>> {
        let state = self.lock()?;
        Ok(state
            .memories
            .values()
            .filter(|rec| filter.matches(rec))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn batch_update_tier(&self, ids: &[MemoryId], tier: &str) -> StorageResult<usize> {
        let now = Utc::now();
        let mut state = self.lock()?;
        Ok(update_each(&mut state, ids, |rec| {
            rec.tier = tier.to_string();
            rec.updated_at = now;
        }))
    }

    async fn batch_mark_summarized(&self, ids: &[MemoryId]) -> StorageResult<usize> {
        let mut state = self.lock()?;
        Ok(update_each(&mut state, ids, |rec| rec.summarized = true))
    }

    async fn update_content(&self, id: MemoryId, content: &str) -> StorageResult<usize> {
        let mut state = self.lock()?;
        Ok(update_each(&mut state, &[id], |rec| {
            rec.content = content.to_string()
        }))
    }

    async fn set_updated_at(&self, ids: &[MemoryId], at: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.lock()?;
        Ok(update_each(&mut state, ids, |rec| rec.updated_at = at))
    }

    async fn upsert_cluster(&self, cluster: &ClusterUpsert) -> StorageResult<ClusterId> {
        let now = Utc::now();
        let key = (
            cluster.owner.clone(),
            cluster.topic.clone(),
            cluster.category.clone(),
        );
        let mut state = self.lock()?;
        let row = state
            .clusters
            .entry(key)
            .or_insert_with(|| ClusterRecord {
                id: ClusterId::new(),
                owner: cluster.owner.clone(),
                topic: cluster.topic.clone(),
                category: cluster.category.clone(),
                member_ids: Vec::new(),
                member_count: 0,
                summary: String::new(),
                created_at: now,
                updated_at: now,
            });
        row.member_ids = cluster.member_ids.clone();
        row.member_count = cluster.member_ids.len();
        row.summary = cluster.summary.clone();
        row.updated_at = now;
        Ok(row.id.clone())
    }

    async fn list_clusters(
        &self,
        owner: &str,
        topic: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<ClusterRecord>> {
        let state = self.lock()?;
        let mut rows: Vec<ClusterRecord> = state
            .clusters
            .values()
            .filter(|c| c.owner == owner && topic.map_or(true, |t| c.topic == t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| (&a.topic, &a.category).cmp(&(&b.topic, &b.category)))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn distinct_threads(
        &self,
        owner: Option<&str>,
        tier: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let state = self.lock()?;
        let threads: BTreeSet<&str> = state
            .memories
            .values()
            .filter(|r| owner.map_or(true, |o| r.owner == o))
            .filter(|r| tier.map_or(true, |t| r.tier == t))
            .filter_map(|r| r.thread.as_deref())
            .filter(|t| !t.is_empty() && after.map_or(true, |a| *t > a))
            .collect();
        Ok(threads.into_iter().take(limit).map(str::to_string).collect())
    }

    async fn threads_by_topic(
        &self,
        owner: &str,
        topic: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let state = self.lock()?;
        let threads: BTreeSet<&str> = state
            .memories
            .values()
            .filter(|r| r.owner == owner)
            .filter(|r| r.metadata.get(KEY_TOPIC).and_then(|v| v.as_str()) == Some(topic))
            .filter_map(|r| r.thread.as_deref())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(threads.into_iter().take(limit).map(str::to_string).collect())
    }

    async fn distinct_owners(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let state = self.lock()?;
        let owners: BTreeSet<&str> = state
            .memories
            .values()
            .map(|r| r.owner.as_str())
            .filter(|o| after.map_or(true, |a| *o > a))
            .collect();
        Ok(owners.into_iter().take(limit).map(str::to_string).collect())
    }

    async fn count_by_tier(&self, owner: Option<&str>) -> StorageResult<BTreeMap<String, usize>> {
        let state = self.lock()?;
        let mut counts = BTreeMap::new();
        for rec in state.memories.values() {
            if owner.map_or(true, |o| rec.owner == o) {
                *counts.entry(rec.tier.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
