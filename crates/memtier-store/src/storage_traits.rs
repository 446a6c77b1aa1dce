//! Storage contract for memtier
//!
//! `MemoryStore` is the only seam between the lifecycle engine and the
//! backing database. It exposes filtered queries, atomic batch updates and
//! an idempotent cluster upsert over a fixed record schema.
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; `surreal_store` provides the SurrealDB backend.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::metadata::Metadata;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Tier assigned by `insert` when the caller does not name one.
pub const DEFAULT_TIER: &str = "short_term";

// ---------------------------------------------------------------------------
// Memory records
// ---------------------------------------------------------------------------

/// Opaque integer id of a memory record, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub owner: String,
    pub namespace: Option<String>,
    pub thread: Option<String>,
    pub content: String,
    pub tier: String,
    /// Score computed at write time, if any
    pub score: Option<u8>,
    pub metadata: Metadata,
    pub summarized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Timestamp used for recency: last update, never earlier than creation.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.updated_at.max(self.created_at)
    }
}

/// Fields supplied by the caller when inserting a memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub owner: String,
    pub content: String,
    pub thread: Option<String>,
    pub namespace: Option<String>,
    /// Defaults to [`DEFAULT_TIER`]
    pub tier: Option<String>,
    pub score: Option<u8>,
    pub metadata: Metadata,
}

impl NewMemory {
    pub fn new(owner: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materialize into a record with the given id and timestamp.
    pub fn into_record(self, id: MemoryId, now: DateTime<Utc>) -> MemoryRecord {
        MemoryRecord {
            id,
            owner: self.owner,
            namespace: self.namespace,
            thread: self.thread,
            content: self.content,
            tier: self.tier.unwrap_or_else(|| DEFAULT_TIER.to_string()),
            score: self.score,
            metadata: self.metadata,
            summarized: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Tri-state predicate on the `summarized` flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizedFilter {
    /// Do not constrain
    #[default]
    Any,
    /// Only summarized records
    Only,
    /// Only records not yet summarized
    Exclude,
}

impl SummarizedFilter {
    pub fn accepts(self, summarized: bool) -> bool {
        match self {
            SummarizedFilter::Any => true,
            SummarizedFilter::Only => summarized,
            SummarizedFilter::Exclude => !summarized,
        }
    }
}

/// Conjunction of optional predicates over memory records.
///
/// An unset field does not constrain the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    pub owner: Option<String>,
    pub thread: Option<String>,
    pub tier: Option<String>,
    pub namespace: Option<String>,
    /// Every entry must be present in the record's metadata with an equal value
    pub metadata: Metadata,
    pub summarized: SummarizedFilter,
    /// Record's thread must be one of these; an empty set matches nothing
    pub threads_any_of: Option<Vec<String>>,
    /// `updated_at` strictly older than this instant
    pub updated_before: Option<DateTime<Utc>>,
    /// Content at least this many characters long
    pub min_chars: Option<usize>,
    /// Id strictly greater than this one
    pub after_id: Option<MemoryId>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn summarized(mut self, summarized: SummarizedFilter) -> Self {
        self.summarized = summarized;
        self
    }

    pub fn threads_any_of(mut self, threads: Vec<String>) -> Self {
        self.threads_any_of = Some(threads);
        self
    }

    pub fn min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = Some(min_chars);
        self
    }

    pub fn after_id(mut self, id: MemoryId) -> Self {
        self.after_id = Some(id);
        self
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        fn eq_opt(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        eq_opt(&self.owner, Some(&record.owner))
            && eq_opt(&self.thread, record.thread.as_deref())
            && eq_opt(&self.tier, Some(&record.tier))
            && eq_opt(&self.namespace, record.namespace.as_deref())
            && record.metadata.contains(&self.metadata)
            && self.summarized.accepts(record.summarized)
            && self.threads_any_of.as_ref().map_or(true, |set| {
                record
                    .thread
                    .as_ref()
                    .is_some_and(|t| set.iter().any(|s| s == t))
            })
            && self
                .updated_before
                .map_or(true, |cutoff| record.updated_at < cutoff)
            && self
                .min_chars
                .map_or(true, |min| record.content.chars().count() >= min)
            && self.after_id.map_or(true, |id| record.id > id)
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Unique identifier of a cluster row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    /// Generate a new random ClusterId
    pub fn new() -> Self {
        ClusterId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired state of the cluster row keyed by (owner, topic, category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUpsert {
    pub owner: String,
    pub topic: String,
    pub category: String,
    pub member_ids: Vec<MemoryId>,
    pub summary: String,
}

/// A stored cluster row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub owner: String,
    pub topic: String,
    pub category: String,
    pub member_ids: Vec<MemoryId>,
    pub member_count: usize,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    /// Last rebuild
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Backing store for memories and clusters.
///
/// Guarantees:
/// - `insert` assigns strictly increasing ids and sets `created_at == updated_at`.
/// - `query` returns records in ascending id order, at most `limit` of them.
/// - Batch updates are atomic per call and return the number of rows touched.
/// - `batch_update_tier` bumps `updated_at`; content and flag updates do not.
/// - `upsert_cluster` keeps at most one row per (owner, topic, category) and
///   returns the same id for every upsert of that key.
/// - Writes are visible to subsequent reads through the same handle.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert a new record and return its id.
    async fn insert(&self, memory: NewMemory) -> StorageResult<MemoryId>;

    /// Fetch one record by id.
    async fn get(&self, id: MemoryId) -> StorageResult<Option<MemoryRecord>>;

    /// Records matching `filter`, ascending by id, capped at `limit`.
    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryRecord>>;

    /// Move records to `tier`, stamping `updated_at = now`.
    async fn batch_update_tier(&self, ids: &[MemoryId], tier: &str) -> StorageResult<usize>;

    /// Set `summarized = true` on the given records.
    async fn batch_mark_summarized(&self, ids: &[MemoryId]) -> StorageResult<usize>;

    /// Replace a record's content in place.
    async fn update_content(&self, id: MemoryId, content: &str) -> StorageResult<usize>;

    /// Overwrite `updated_at` (backfill and administrative use).
    async fn set_updated_at(&self, ids: &[MemoryId], at: DateTime<Utc>) -> StorageResult<usize>;

    /// Create or replace the cluster for (owner, topic, category).
    async fn upsert_cluster(&self, cluster: &ClusterUpsert) -> StorageResult<ClusterId>;

    /// Clusters of an owner, most recently rebuilt first.
    async fn list_clusters(
        &self,
        owner: &str,
        topic: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<ClusterRecord>>;

    /// Distinct non-empty thread ids, sorted. With `after`, only ids that
    /// sort strictly after it, so callers can page through every thread.
    async fn distinct_threads(
        &self,
        owner: Option<&str>,
        tier: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>>;

    /// Threads of `owner` holding at least one record whose metadata topic
    /// equals `topic` exactly, sorted.
    async fn threads_by_topic(
        &self,
        owner: &str,
        topic: &str,
        limit: usize,
    ) -> StorageResult<Vec<String>>;

    /// Distinct owners, sorted, optionally starting strictly after `after`.
    async fn distinct_owners(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>>;

    /// Record count per tier, optionally for one owner.
    async fn count_by_tier(&self, owner: Option<&str>) -> StorageResult<BTreeMap<String, usize>>;
}
