//! Retention policy execution.
//!
//! One run walks the configured tiers in order (trim, then migrate), makes a
//! single summarization pass, aggregates long threads in the terminal tier,
//! and finally rebuilds topic clusters. Each step fetches at most
//! `policies.batch_limit` records, filtered by length in the store, and
//! resumes after the last id it saw on the next run. Whatever is left over
//! converges on later runs. Owner and thread fan-out pages through every
//! owner and thread in batches of `batch_limit`.
//!
//! Steps are independent. A failing step is logged and skipped, and the run
//! still returns the counts of everything that did succeed.
//!
//! Runs for the same owner are serialized within one executor. Runs for
//! different owners, and runs in other processes, may still overlap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use memtier_store::{
    MemoryFilter, MemoryId, MemoryRecord, MemoryStore, Metadata, NewMemory, StorageResult,
    SummarizedFilter, KEY_KIND, THREAD_SUMMARY_KIND,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, Instrument};

use crate::clustering::Clustering;
use crate::config::{MemtierConfig, TierConfig};
use crate::error::MemtierResult;
use crate::metrics::Metrics;
use crate::obs::{self, PolicyRunSpan};
use crate::text::{build_summarizer, build_trimmer, Summarizer, Trimmer};

/// Lock key for runs that span every owner.
const ALL_OWNERS: &str = "*";

/// Counts produced by one policy run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRunSummary {
    pub run_id: String,
    pub owner: Option<String>,
    pub migrated: usize,
    pub trimmed: usize,
    pub summarized: usize,
    pub thread_summaries: usize,
    pub clusters: usize,
    /// Record count per tier after the run
    pub by_tier: BTreeMap<String, usize>,
    /// Steps that failed, as `kind[:tier]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_steps: Vec<String>,
    pub ran_at: DateTime<Utc>,
}

/// Applies the configured retention policies to a store.
pub struct PolicyExecutor {
    store: Arc<dyn MemoryStore>,
    config: MemtierConfig,
    trimmer: Arc<dyn Trimmer>,
    summarizer: Arc<dyn Summarizer>,
    clustering: Clustering,
    metrics: Option<Arc<Metrics>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Last id seen per step and owner, while a backlog remains
    cursors: Mutex<HashMap<String, MemoryId>>,
}

impl fmt::Debug for PolicyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyExecutor")
            .field("tiers", &self.config.tier_names())
            .field("trimmer", &self.trimmer.name())
            .field("summarizer", &self.summarizer.name())
            .finish_non_exhaustive()
    }
}

impl PolicyExecutor {
    /// Build with explicit text processors. Fails on invalid configuration.
    pub fn new(
        store: Arc<dyn MemoryStore>,
        config: MemtierConfig,
        trimmer: Arc<dyn Trimmer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> MemtierResult<Self> {
        config.validate()?;

        let mut clustering = Clustering::new(store.clone(), config.clustering)
            .with_fetch_limit(config.policies.batch_limit);
        if config.storage.tiers.iter().any(|t| t.cluster) {
            clustering = clustering.with_tiers(config.cluster_tiers());
        }
        if config.summarization.enabled {
            clustering = clustering.with_summarizer(summarizer.clone());
        }

        Ok(Self {
            store,
            config,
            trimmer,
            summarizer,
            clustering,
            metrics: None,
            locks: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Build with the text processors named in `text_processing`.
    pub fn from_config(store: Arc<dyn MemoryStore>, config: MemtierConfig) -> MemtierResult<Self> {
        let trimmer = build_trimmer(&config.text_processing.trimmer);
        let summarizer = build_summarizer(&config.text_processing.summarizer);
        Self::new(store, config, trimmer, summarizer)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.clustering = self.clustering.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MemtierConfig {
        &self.config
    }

    pub fn clustering(&self) -> &Clustering {
        &self.clustering
    }

    /// Run every policy for `owner`, or for all owners when `None`.
    pub async fn run(&self, owner: Option<&str>) -> PolicyRunSummary {
        self.run_at(owner, Utc::now()).await
    }

    /// Run with `now` as the reference time for age thresholds.
    pub async fn run_at(&self, owner: Option<&str>, now: DateTime<Utc>) -> PolicyRunSummary {
        let key = owner.unwrap_or(ALL_OWNERS);
        let lock = self.owner_lock(key).await;
        let guard = lock.lock().await;

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = PolicyRunSpan::new(&run_id, owner);
        let summary = self.execute(run_id, owner, now).instrument(span.span()).await;

        drop(guard);
        self.release_lock(key, lock).await;
        summary
    }

    async fn owner_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Forget the lock for `key` unless another run holds or awaits it.
    async fn release_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn execute(
        &self,
        run_id: String,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> PolicyRunSummary {
        let started = Instant::now();
        let mut summary = PolicyRunSummary {
            run_id,
            owner: owner.map(str::to_string),
            ran_at: now,
            ..Default::default()
        };
        let mut moved_this_run: HashSet<MemoryId> = HashSet::new();

        for (idx, tier) in self.config.storage.tiers.iter().enumerate() {
            if let Some(trim) = tier.trim {
                match self.trim_tier(owner, tier, trim.max_chars).await {
                    Ok(n) => summary.trimmed += n,
                    Err(e) => fail(&mut summary, "trim", Some(tier.name.as_str()), &e),
                }
            }
            if let Some(days) = tier.migration_days() {
                let Some(next) = self.config.storage.tiers.get(idx + 1) else {
                    continue;
                };
                match self
                    .migrate_tier(owner, tier, &next.name, days, now, &mut moved_this_run)
                    .await
                {
                    Ok(n) => summary.migrated += n,
                    Err(e) => fail(&mut summary, "migrate", Some(tier.name.as_str()), &e),
                }
            }
        }

        if self.config.summarization.enabled {
            match self.summarize_pass(owner).await {
                Ok(n) => summary.summarized += n,
                Err(e) => fail(&mut summary, "summarize", None, &e),
            }
        }

        match self.aggregate_threads(owner).await {
            Ok(n) => summary.thread_summaries += n,
            Err(e) => fail(&mut summary, "thread_summarize", self.config.terminal_tier(), &e),
        }

        if self.config.clustering.enabled {
            match self.rebuild_clusters(owner).await {
                Ok(n) => summary.clusters += n,
                Err(e) => fail(&mut summary, "cluster", None, &e),
            }
        }

        match self.store.count_by_tier(owner).await {
            Ok(counts) => summary.by_tier = counts,
            Err(e) => fail(&mut summary, "count", None, &e),
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_policy_runs();
            metrics.add_migrated(summary.migrated);
            metrics.add_trimmed(summary.trimmed);
            metrics.add_summarized(summary.summarized);
            metrics.add_thread_summaries(summary.thread_summaries);
        }
        obs::emit_policy_run_finished(
            &summary.run_id,
            owner,
            summary.migrated,
            summary.trimmed,
            summary.summarized,
            summary.thread_summaries,
            summary.clusters,
            started.elapsed().as_millis() as u64,
        );
        summary
    }

    fn scoped(owner: Option<&str>) -> MemoryFilter {
        match owner {
            Some(owner) => MemoryFilter::new().owner(owner),
            None => MemoryFilter::new(),
        }
    }

    /// The given owner, or every owner in the store.
    async fn owners(&self, owner: Option<&str>) -> StorageResult<Vec<String>> {
        if let Some(owner) = owner {
            return Ok(vec![owner.to_string()]);
        }
        let page_size = self.config.policies.batch_limit.max(1);
        let mut owners: Vec<String> = Vec::new();
        loop {
            let page = self
                .store
                .distinct_owners(owners.last().map(String::as_str), page_size)
                .await?;
            let exhausted = page.len() < page_size;
            owners.extend(page);
            if exhausted {
                return Ok(owners);
            }
        }
    }

    /// Every thread of `owner` in `tier`.
    async fn threads(&self, owner: &str, tier: &str) -> StorageResult<Vec<String>> {
        let page_size = self.config.policies.batch_limit.max(1);
        let mut threads: Vec<String> = Vec::new();
        loop {
            let page = self
                .store
                .distinct_threads(
                    Some(owner),
                    Some(tier),
                    threads.last().map(String::as_str),
                    page_size,
                )
                .await?;
            let exhausted = page.len() < page_size;
            threads.extend(page);
            if exhausted {
                return Ok(threads);
            }
        }
    }

    /// Next `batch_limit` matches after the cursor stored under `key`.
    ///
    /// A full page advances the cursor. A short page clears it, so the
    /// following run starts from the lowest id again.
    async fn next_window(
        &self,
        key: String,
        filter: MemoryFilter,
    ) -> StorageResult<Vec<MemoryRecord>> {
        let limit = self.config.policies.batch_limit;
        let cursor = self.cursors.lock().await.get(&key).copied();
        let filter = match cursor {
            Some(id) => filter.after_id(id),
            None => filter,
        };
        let records = self.store.query(&filter, limit).await?;

        let mut cursors = self.cursors.lock().await;
        match records.last() {
            Some(last) if records.len() >= limit => {
                cursors.insert(key, last.id);
            }
            _ => {
                cursors.remove(&key);
            }
        }
        Ok(records)
    }

    fn cursor_key(step: &str, tier: Option<&str>, owner: Option<&str>) -> String {
        format!(
            "{step}:{}:{}",
            tier.unwrap_or_default(),
            owner.unwrap_or(ALL_OWNERS)
        )
    }

    async fn trim_tier(
        &self,
        owner: Option<&str>,
        tier: &TierConfig,
        max_chars: usize,
    ) -> StorageResult<usize> {
        let filter = Self::scoped(owner)
            .tier(tier.name.as_str())
            .min_chars(max_chars.saturating_add(1));
        let key = Self::cursor_key("trim", Some(tier.name.as_str()), owner);
        let records = self.next_window(key, filter).await?;

        let mut trimmed = 0;
        for record in records {
            let shorter = self.trimmer.trim(&record.content, max_chars);
            if shorter == record.content {
                continue;
            }
            match self.store.update_content(record.id, &shorter).await {
                Ok(n) if n > 0 => trimmed += 1,
                Ok(_) => debug!(memory_id = %record.id, "record vanished before trim"),
                Err(e) => obs::emit_policy_step_failed("trim", Some(tier.name.as_str()), &e),
            }
        }
        if trimmed > 0 {
            obs::emit_policy_step(
                "trim",
                Some(tier.name.as_str()),
                trimmed,
                &format!("max_chars={max_chars} trimmer={}", self.trimmer.name()),
            );
        }
        Ok(trimmed)
    }

    async fn migrate_tier(
        &self,
        owner: Option<&str>,
        tier: &TierConfig,
        next: &str,
        expiry_days: u32,
        now: DateTime<Utc>,
        moved_this_run: &mut HashSet<MemoryId>,
    ) -> StorageResult<usize> {
        let cutoff = now - Duration::days(i64::from(expiry_days));
        let filter = Self::scoped(owner)
            .tier(tier.name.as_str())
            .updated_before(cutoff);
        let records = self
            .store
            .query(&filter, self.config.policies.batch_limit)
            .await?;

        let ids: Vec<MemoryId> = records
            .iter()
            .map(|r| r.id)
            .filter(|id| !moved_this_run.contains(id))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let moved = self.store.batch_update_tier(&ids, next).await?;
        moved_this_run.extend(ids);
        obs::emit_policy_step(
            "migrate",
            Some(tier.name.as_str()),
            moved,
            &format!("to_tier={next} age_days={expiry_days}"),
        );
        Ok(moved)
    }

    async fn summarize_pass(&self, owner: Option<&str>) -> StorageResult<usize> {
        let cfg = self.config.summarization;
        let filter = Self::scoped(owner)
            .summarized(SummarizedFilter::Exclude)
            .min_chars(cfg.min_chars);
        let records = self
            .next_window(Self::cursor_key("summarize", None, owner), filter)
            .await?;

        let mut summarized = 0;
        for record in records {
            if record.metadata.is_thread_summary() {
                continue;
            }
            let condensed = self
                .summarizer
                .summarize(&record.content, cfg.target_chars)
                .await;
            if condensed == record.content {
                continue;
            }
            if let Err(e) = self.store.update_content(record.id, &condensed).await {
                obs::emit_policy_step_failed("summarize", Some(record.tier.as_str()), &e);
                continue;
            }
            summarized += 1;
            if cfg.mark_summarized {
                if let Err(e) = self.store.batch_mark_summarized(&[record.id]).await {
                    obs::emit_policy_step_failed("summarize", Some(record.tier.as_str()), &e);
                }
            }
        }
        if summarized > 0 {
            obs::emit_policy_step(
                "summarize",
                None,
                summarized,
                &format!(
                    "min_chars={} target_chars={} summarizer={}",
                    cfg.min_chars,
                    cfg.target_chars,
                    self.summarizer.name()
                ),
            );
        }
        Ok(summarized)
    }

    /// Collapse long threads of the terminal tier into one aggregate record.
    async fn aggregate_threads(&self, owner: Option<&str>) -> StorageResult<usize> {
        let Some(terminal) = self.config.terminal_tier() else {
            return Ok(0);
        };
        let agg = self.config.aggregation;

        let mut created = 0;
        for owner in self.owners(owner).await? {
            for thread in self.threads(&owner, terminal).await? {
                match self.aggregate_thread(&owner, &thread, terminal).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => obs::emit_policy_step_failed("thread_summarize", Some(terminal), &e),
                }
            }
        }
        if created > 0 {
            obs::emit_policy_step(
                "thread_summarize",
                Some(terminal),
                created,
                &format!(
                    "min_records={} summary_chars={}",
                    agg.min_thread_records, agg.summary_chars
                ),
            );
        }
        Ok(created)
    }

    /// Returns whether a new aggregate was inserted.
    async fn aggregate_thread(&self, owner: &str, thread: &str, tier: &str) -> StorageResult<bool> {
        let agg = self.config.aggregation;
        let scope = MemoryFilter::new().owner(owner).thread(thread).tier(tier);

        let mut members = self
            .store
            .query(
                &scope.clone().summarized(SummarizedFilter::Exclude),
                agg.batch_size,
            )
            .await?;
        members.retain(|r| !r.metadata.is_thread_summary());
        if members.len() < agg.min_thread_records {
            return Ok(false);
        }

        let marker = Metadata::new().with(KEY_KIND, THREAD_SUMMARY_KIND);
        let existing = self
            .store
            .query(&scope.metadata(marker.clone()), 1)
            .await?;

        let mut inserted = false;
        if existing.is_empty() {
            let joined = members
                .iter()
                .map(|r| r.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let text = self.summarizer.summarize(&joined, agg.summary_chars).await;
            let mut aggregate = NewMemory::new(owner, text)
                .with_thread(thread)
                .with_tier(tier)
                .with_metadata(marker);
            aggregate.namespace = members[0].namespace.clone();
            let id = self.store.insert(aggregate).await?;
            debug!(memory_id = %id, thread, members = members.len(), "inserted thread aggregate");
            inserted = true;
        }

        let ids: Vec<MemoryId> = members.iter().map(|r| r.id).collect();
        self.store.batch_mark_summarized(&ids).await?;
        Ok(inserted)
    }

    async fn rebuild_clusters(&self, owner: Option<&str>) -> MemtierResult<usize> {
        let mut total = 0;
        for owner in self.owners(owner).await? {
            total += self.clustering.rebuild(&owner).await?;
        }
        Ok(total)
    }
}

fn fail(
    summary: &mut PolicyRunSummary,
    kind: &str,
    tier: Option<&str>,
    error: &dyn std::fmt::Display,
) {
    obs::emit_policy_step_failed(kind, tier, error);
    summary.failed_steps.push(match tier {
        Some(tier) => format!("{kind}:{tier}"),
        None => kind.to_string(),
    });
}
