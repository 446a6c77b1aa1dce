//! SurrealDB-backed MemoryStore implementation
//!
//! Uses `schema::MemoryRow` and `schema::ClusterRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::method::Query;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::handle::{self, CloudConfig};
use crate::metadata::KEY_TOPIC;
use crate::schema::{self, ClusterRow, CounterRow, MemoryRow, OwnerRow, ThreadRow, TierCountRow};
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`MemoryStore`].
#[derive(Clone)]
pub struct SurrealMemoryStore {
    db: Surreal<Any>,
}

impl SurrealMemoryStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `memtier/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealMemoryStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Connect to an explicit URL (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = handle::connect_url(url).await?;
        info!("SurrealMemoryStore connected ({})", url);
        Ok(Self { db })
    }

    /// Connect to SurrealDB Cloud.
    pub async fn connect_cloud(config: &CloudConfig) -> crate::Result<Self> {
        let db = handle::connect_cloud(config).await?;
        info!("SurrealMemoryStore connected (cloud)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Cloud config, then `SURREALDB_URL`, then local persistence in `.memtier/db`.
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env(handle::LOCAL_DB_PATH).await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    /// Allocate the next memory id from `counters:memories`.
    async fn next_memory_id(&self) -> StorageResult<i64> {
        let mut res = self
            .db
            .query("UPSERT counters:memories SET value = (value OR 0) + 1 RETURN AFTER")
            .await?;
        let rows: Vec<CounterRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(|row| row.value)
            .ok_or_else(|| StorageError::Backend("id counter returned no row".to_string()))
    }

    async fn find_cluster(
        &self,
        owner: &str,
        topic: &str,
        category: &str,
    ) -> StorageResult<Option<ClusterRow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM clusters WHERE owner = $owner AND topic = $topic AND category = $category",
            )
            .bind(("owner", owner.to_string()))
            .bind(("topic", topic.to_string()))
            .bind(("category", category.to_string()))
            .await?;
        let rows: Vec<ClusterRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn update_cluster(
        &self,
        cluster_id: &str,
        cluster: &ClusterUpsert,
    ) -> StorageResult<ClusterId> {
        let members = schema::ids_to_db(&cluster.member_ids);
        let mut res = self
            .db
            .query(
                "UPDATE clusters SET member_ids = $members, member_count = $count, \
                 summary = $summary, updated_at = $now WHERE cluster_id = $cid RETURN AFTER",
            )
            .bind(("count", members.len() as i64))
            .bind(("members", members))
            .bind(("summary", cluster.summary.clone()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("cid", cluster_id.to_string()))
            .await?;
        let rows: Vec<ClusterRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(|row| ClusterId(row.cluster_id))
            .ok_or_else(|| StorageError::Backend(format!("cluster {cluster_id} vanished during update")))
    }

    async fn create_cluster(&self, cluster: &ClusterUpsert) -> StorageResult<ClusterId> {
        let now = Utc::now();
        let members = schema::ids_to_db(&cluster.member_ids);
        let row = ClusterRow {
            id: None,
            cluster_id: ClusterId::new().0,
            owner: cluster.owner.clone(),
            topic: cluster.topic.clone(),
            category: cluster.category.clone(),
            member_count: members.len() as i64,
            member_ids: members,
            summary: cluster.summary.clone(),
            created_at: now,
            updated_at: now,
        };
        let created: Option<ClusterRow> = self.db.create("clusters").content(row).await?;
        created
            .map(|row| ClusterId(row.cluster_id))
            .ok_or_else(|| StorageError::Backend("failed to create cluster".to_string()))
    }

    /// Run an UPDATE returning full rows and report how many were touched.
    async fn count_updated(&self, query: Query<'_, Any>) -> StorageResult<usize> {
        let mut res = query.await?;
        let rows: Vec<MemoryRow> = res.take(0)?;
        Ok(rows.len())
    }
}

/// Metadata keys are spliced into SurrealQL as field paths, so they must be
/// plain identifiers.
fn is_field_name(key: &str) -> bool {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .map(|re| re.is_match(key))
        .unwrap_or(false)
}

/// Build the WHERE clause for a filter. Parameter names match [`bind_filter`].
fn where_clause(filter: &MemoryFilter) -> StorageResult<String> {
    let mut clauses: Vec<String> = Vec::new();
    if filter.owner.is_some() {
        clauses.push("owner = $owner".into());
    }
    if filter.thread.is_some() {
        clauses.push("thread_id = $thread".into());
    }
    if filter.tier.is_some() {
        clauses.push("tier = $tier".into());
    }
    if filter.namespace.is_some() {
        clauses.push("namespace = $namespace".into());
    }
    for (i, (key, _)) in filter.metadata.iter().enumerate() {
        if !is_field_name(key) {
            return Err(StorageError::InvalidFilter {
                reason: format!("metadata key {key:?} is not an identifier"),
            });
        }
        clauses.push(format!("metadata.{key} = $mf{i}"));
    }
    match filter.summarized {
        SummarizedFilter::Any => {}
        SummarizedFilter::Only => clauses.push("summarized = true".into()),
        SummarizedFilter::Exclude => clauses.push("summarized = false".into()),
    }
    if filter.threads_any_of.is_some() {
        clauses.push("thread_id INSIDE $threads".into());
    }
    if filter.updated_before.is_some() {
        clauses.push("updated_at < $updated_before".into());
    }
    if filter.min_chars.is_some() {
        clauses.push("string::len(content) >= $min_chars".into());
    }
    if filter.after_id.is_some() {
        clauses.push("memory_id > $after_id".into());
    }

    if clauses.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("WHERE {}", clauses.join(" AND ")))
    }
}

fn bind_filter<'a>(mut query: Query<'a, Any>, filter: &MemoryFilter) -> Query<'a, Any> {
    if let Some(owner) = &filter.owner {
        query = query.bind(("owner", owner.clone()));
    }
    if let Some(thread) = &filter.thread {
        query = query.bind(("thread", thread.clone()));
    }
    if let Some(tier) = &filter.tier {
        query = query.bind(("tier", tier.clone()));
    }
    if let Some(namespace) = &filter.namespace {
        query = query.bind(("namespace", namespace.clone()));
    }
    for (i, (_, value)) in filter.metadata.iter().enumerate() {
        query = query.bind((format!("mf{i}"), value.clone()));
    }
    if let Some(threads) = &filter.threads_any_of {
        query = query.bind(("threads", threads.clone()));
    }
    if let Some(cutoff) = filter.updated_before {
        query = query.bind(("updated_before", SurrealDatetime::from(cutoff)));
    }
    if let Some(min_chars) = filter.min_chars {
        query = query.bind(("min_chars", i64::try_from(min_chars).unwrap_or(i64::MAX)));
    }
    if let Some(id) = filter.after_id {
        query = query.bind(("after_id", i64::try_from(id.0).unwrap_or(i64::MAX)));
    }
    query
}

#[async_trait]
impl MemoryStore for SurrealMemoryStore {
    #[instrument(skip(self, memory), fields(owner = %memory.owner))]
    async fn insert(&self, memory: NewMemory) -> StorageResult<MemoryId> {
        let memory_id = self.next_memory_id().await?;
        let row = MemoryRow::from_new(memory_id, memory, Utc::now());

        let created: Option<MemoryRow> = self.db.create("memories").content(row).await?;
        let record = created
            .ok_or_else(|| StorageError::Backend("failed to create memory".to_string()))?
            .into_record()?;

        debug!(memory_id = %record.id, tier = %record.tier, "memory inserted");
        Ok(record.id)
    }

    async fn get(&self, id: MemoryId) -> StorageResult<Option<MemoryRecord>> {
        let Ok(db_id) = i64::try_from(id.0) else {
            return Ok(None);
        };
        let mut res = self
            .db
            .query("SELECT * FROM memories WHERE memory_id = $id")
            .bind(("id", db_id))
            .await?;
        let rows: Vec<MemoryRow> = res.take(0)?;
        rows.into_iter().next().map(MemoryRow::into_record).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryRecord>> {
        let sql = format!(
            "SELECT * FROM memories {} ORDER BY memory_id ASC LIMIT {}",
            where_clause(filter)?,
            limit
        );
        let mut res = bind_filter(self.db.query(sql), filter).await?;
        let rows: Vec<MemoryRow> = res.take(0)?;
        debug!(rows = rows.len(), "memory query");
        rows.into_iter().map(MemoryRow::into_record).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn batch_update_tier(&self, ids: &[MemoryId], tier: &str) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = self
            .db
            .query(
                "UPDATE memories SET tier = $tier, updated_at = $now \
                 WHERE memory_id INSIDE $ids RETURN AFTER",
            )
            .bind(("tier", tier.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("ids", schema::ids_to_db(ids)));
        self.count_updated(query).await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn batch_mark_summarized(&self, ids: &[MemoryId]) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = self
            .db
            .query("UPDATE memories SET summarized = true WHERE memory_id INSIDE $ids RETURN AFTER")
            .bind(("ids", schema::ids_to_db(ids)));
        self.count_updated(query).await
    }

    async fn update_content(&self, id: MemoryId, content: &str) -> StorageResult<usize> {
        let query = self
            .db
            .query("UPDATE memories SET content = $content WHERE memory_id INSIDE $ids RETURN AFTER")
            .bind(("content", content.to_string()))
            .bind(("ids", schema::ids_to_db(&[id])));
        self.count_updated(query).await
    }

    async fn set_updated_at(&self, ids: &[MemoryId], at: DateTime<Utc>) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = self
            .db
            .query("UPDATE memories SET updated_at = $at WHERE memory_id INSIDE $ids RETURN AFTER")
            .bind(("at", SurrealDatetime::from(at)))
            .bind(("ids", schema::ids_to_db(ids)));
        self.count_updated(query).await
    }

    #[instrument(skip(self, cluster), fields(owner = %cluster.owner, topic = %cluster.topic, category = %cluster.category))]
    async fn upsert_cluster(&self, cluster: &ClusterUpsert) -> StorageResult<ClusterId> {
        if let Some(existing) = self
            .find_cluster(&cluster.owner, &cluster.topic, &cluster.category)
            .await?
        {
            return self.update_cluster(&existing.cluster_id, cluster).await;
        }

        match self.create_cluster(cluster).await {
            Ok(id) => Ok(id),
            Err(create_err) => {
                // Lost a race on the unique key: the row exists now, update it.
                let existing = self
                    .find_cluster(&cluster.owner, &cluster.topic, &cluster.category)
                    .await?;
                match existing {
                    Some(row) => {
                        warn!("cluster create collided with a concurrent upsert, updating");
                        self.update_cluster(&row.cluster_id, cluster).await
                    }
                    None => Err(create_err),
                }
            }
        }
    }

    async fn list_clusters(
        &self,
        owner: &str,
        topic: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<ClusterRecord>> {
        let topic_clause = if topic.is_some() { " AND topic = $topic" } else { "" };
        let sql = format!(
            "SELECT * FROM clusters WHERE owner = $owner{topic_clause} \
             ORDER BY updated_at DESC, topic ASC, category ASC LIMIT {limit}"
        );
        let mut query = self.db.query(sql).bind(("owner", owner.to_string()));
        if let Some(topic) = topic {
            query = query.bind(("topic", topic.to_string()));
        }
        let mut res = query.await?;
        let rows: Vec<ClusterRow> = res.take(0)?;
        rows.into_iter().map(ClusterRow::into_record).collect()
    }

    async fn distinct_threads(
        &self,
        owner: Option<&str>,
        tier: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let mut filter = MemoryFilter::new();
        filter.owner = owner.map(str::to_string);
        filter.tier = tier.map(str::to_string);
        let sql = format!(
            "SELECT thread_id FROM memories {} GROUP BY thread_id",
            where_clause(&filter)?
        );
        let mut res = bind_filter(self.db.query(sql), &filter).await?;
        let rows: Vec<ThreadRow> = res.take(0)?;
        Ok(sorted_threads(rows, after, limit))
    }

    async fn threads_by_topic(
        &self,
        owner: &str,
        topic: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let filter = MemoryFilter::new()
            .owner(owner)
            .metadata(crate::Metadata::new().with(KEY_TOPIC, topic));
        let sql = format!(
            "SELECT thread_id FROM memories {} GROUP BY thread_id",
            where_clause(&filter)?
        );
        let mut res = bind_filter(self.db.query(sql), &filter).await?;
        let rows: Vec<ThreadRow> = res.take(0)?;
        Ok(sorted_threads(rows, None, limit))
    }

    async fn distinct_owners(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let mut res = self
            .db
            .query("SELECT owner FROM memories GROUP BY owner")
            .await?;
        let rows: Vec<OwnerRow> = res.take(0)?;
        let mut owners: Vec<String> = rows
            .into_iter()
            .map(|r| r.owner)
            .filter(|o| after.map_or(true, |a| o.as_str() > a))
            .collect();
        owners.sort();
        owners.dedup();
        owners.truncate(limit);
        Ok(owners)
    }

    async fn count_by_tier(&self, owner: Option<&str>) -> StorageResult<BTreeMap<String, usize>> {
        let owner_clause = if owner.is_some() { "WHERE owner = $owner" } else { "" };
        let sql = format!("SELECT tier, count() AS count FROM memories {owner_clause} GROUP BY tier");
        let mut query = self.db.query(sql);
        if let Some(owner) = owner {
            query = query.bind(("owner", owner.to_string()));
        }
        let mut res = query.await?;
        let rows: Vec<TierCountRow> = res.take(0)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.tier, usize::try_from(r.count).unwrap_or(0)))
            .collect())
    }
}

fn sorted_threads(rows: Vec<ThreadRow>, after: Option<&str>, limit: usize) -> Vec<String> {
    let mut threads: Vec<String> = rows
        .into_iter()
        .filter_map(|r| r.thread_id)
        .filter(|t| !t.is_empty() && after.map_or(true, |a| t.as_str() > a))
        .collect();
    threads.sort();
    threads.dedup();
    threads.truncate(limit);
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_is_empty_for_empty_filter() {
        assert_eq!(where_clause(&MemoryFilter::new()).unwrap(), "");
    }

    #[test]
    fn where_clause_joins_predicates() {
        let filter = MemoryFilter::new()
            .owner("u1")
            .metadata(crate::Metadata::new().with("topic", "refund"))
            .summarized(SummarizedFilter::Exclude);
        let clause = where_clause(&filter).unwrap();
        assert_eq!(
            clause,
            "WHERE owner = $owner AND metadata.topic = $mf0 AND summarized = false"
        );
    }

    #[test]
    fn where_clause_pushes_length_into_the_query() {
        let filter = MemoryFilter::new().tier("long_term").min_chars(1001);
        assert_eq!(
            where_clause(&filter).unwrap(),
            "WHERE tier = $tier AND string::len(content) >= $min_chars"
        );
    }

    #[test]
    fn where_clause_rejects_non_identifier_keys() {
        let filter =
            MemoryFilter::new().metadata(crate::Metadata::new().with("topic; DELETE memories", 1));
        assert!(matches!(
            where_clause(&filter),
            Err(StorageError::InvalidFilter { .. })
        ));
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let store = SurrealMemoryStore::in_memory().await.unwrap();
        let a = store.insert(NewMemory::new("u1", "a")).await.unwrap();
        let b = store.insert(NewMemory::new("u1", "b")).await.unwrap();
        assert!(b > a);
    }
}
