//! Topic clusters.
//!
//! [`group`] buckets records by `(owner, topic, category)` where topic and
//! category come from metadata, lowercased, defaulting to `"general"`.
//! [`Clustering::rebuild`] regroups an owner's eligible records and upserts
//! one cluster row per bucket. The store keeps a single row per key, so
//! rebuilding twice over unchanged data leaves the same rows behind.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use memtier_store::{ClusterUpsert, MemoryFilter, MemoryId, MemoryRecord, MemoryStore};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::ClusteringConfig;
use crate::error::MemtierResult;
use crate::metrics::Metrics;
use crate::obs;
use crate::text::Summarizer;

/// Bucket label used when a record has no topic or category.
pub const GENERAL: &str = "general";

/// One bucket produced by [`group`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterDraft {
    pub owner: String,
    pub topic: String,
    pub category: String,
    /// Ascending
    pub member_ids: Vec<MemoryId>,
}

fn key_part(value: Option<&str>) -> String {
    value
        .map(str::to_lowercase)
        .unwrap_or_else(|| GENERAL.to_string())
}

/// Group records by owner and (topic, category).
///
/// Output is ordered by key and member ids are ascending, independent of
/// input order.
pub fn group(records: &[MemoryRecord]) -> Vec<ClusterDraft> {
    let mut buckets: BTreeMap<(String, String, String), Vec<MemoryId>> = BTreeMap::new();
    for record in records {
        let key = (
            record.owner.clone(),
            key_part(record.metadata.topic()),
            key_part(record.metadata.category()),
        );
        buckets.entry(key).or_default().push(record.id);
    }
    buckets
        .into_iter()
        .map(|((owner, topic, category), mut member_ids)| {
            member_ids.sort_unstable();
            member_ids.dedup();
            ClusterDraft {
                owner,
                topic,
                category,
                member_ids,
            }
        })
        .collect()
}

/// Rebuilds an owner's clusters against a store.
#[derive(Clone)]
pub struct Clustering {
    store: Arc<dyn MemoryStore>,
    config: ClusteringConfig,
    /// Tiers whose records are eligible; empty means every tier
    tiers: Vec<String>,
    fetch_limit: usize,
    summarizer: Option<Arc<dyn Summarizer>>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for Clustering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clustering")
            .field("config", &self.config)
            .field("tiers", &self.tiers)
            .field("fetch_limit", &self.fetch_limit)
            .finish_non_exhaustive()
    }
}

impl Clustering {
    pub fn new(store: Arc<dyn MemoryStore>, config: ClusteringConfig) -> Self {
        Self {
            store,
            config,
            tiers: Vec::new(),
            fetch_limit: 1000,
            summarizer: None,
            metrics: None,
        }
    }

    pub fn with_tiers<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tiers = tiers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit;
        self
    }

    /// Summarize member content into the cluster summary.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Regroup `owner`'s records and upsert every bucket that reaches
    /// `min_cluster_size`. Returns the number of clusters created or updated.
    #[instrument(skip(self))]
    pub async fn rebuild(&self, owner: &str) -> MemtierResult<usize> {
        let records = self.eligible(owner).await?;
        let drafts: Vec<ClusterDraft> = group(&records)
            .into_iter()
            .filter(|d| d.member_ids.len() >= self.config.min_cluster_size)
            .collect();
        debug!(records = records.len(), drafts = drafts.len(), "grouped records");

        let by_id: BTreeMap<MemoryId, &MemoryRecord> = records.iter().map(|r| (r.id, r)).collect();
        let mut upserted = 0;
        let mut members = 0;
        for draft in drafts {
            let summary = self.summary_for(&draft, &by_id).await;
            members += draft.member_ids.len();
            let upsert = ClusterUpsert {
                owner: draft.owner,
                topic: draft.topic,
                category: draft.category,
                member_ids: draft.member_ids,
                summary,
            };
            self.store.upsert_cluster(&upsert).await?;
            upserted += 1;
        }

        obs::emit_cluster_rebuilt(owner, upserted, members);
        if let Some(metrics) = &self.metrics {
            metrics.add_clusters(upserted);
        }
        Ok(upserted)
    }

    /// Owner's records in the eligible tiers, aggregates excluded.
    async fn eligible(&self, owner: &str) -> MemtierResult<Vec<MemoryRecord>> {
        let base = MemoryFilter::new().owner(owner);
        let mut out = if self.tiers.is_empty() {
            self.store.query(&base, self.fetch_limit).await?
        } else {
            let mut seen = HashSet::new();
            let mut rows = Vec::new();
            for tier in &self.tiers {
                let batch = self
                    .store
                    .query(&base.clone().tier(tier.as_str()), self.fetch_limit)
                    .await?;
                rows.extend(batch.into_iter().filter(|r| seen.insert(r.id)));
            }
            rows
        };
        out.retain(|r| !r.metadata.is_thread_summary());
        Ok(out)
    }

    async fn summary_for(
        &self,
        draft: &ClusterDraft,
        by_id: &BTreeMap<MemoryId, &MemoryRecord>,
    ) -> String {
        let descriptor = format!(
            "{} memories about {} ({})",
            draft.member_ids.len(),
            draft.topic,
            draft.category
        );
        let Some(summarizer) = &self.summarizer else {
            return descriptor;
        };
        let joined = draft
            .member_ids
            .iter()
            .filter_map(|id| by_id.get(id))
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if joined.trim().is_empty() {
            return descriptor;
        }
        summarizer.summarize(&joined, self.config.summary_chars).await
    }
}
