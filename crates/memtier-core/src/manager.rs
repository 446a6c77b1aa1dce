//! `MemoryManager`: one handle over the whole engine.
//!
//! Every collaborator is passed in or built from the configuration at
//! construction; there is no process-wide instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use memtier_store::{ClusterRecord, MemoryId, MemoryRecord, MemoryStore, NewMemory};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::MemtierConfig;
use crate::context::{AssembledContext, ContextAssembler, ContextFormat};
use crate::error::{MemtierError, MemtierResult};
use crate::metrics::Metrics;
use crate::policy::{PolicyExecutor, PolicyRunSummary};
use crate::retriever::{Retriever, ScoredMemory, SearchRequest};
use crate::scoring::{ScoreBreakdown, ScoringEngine};
use crate::text::{build_summarizer, build_trimmer, Summarizer, Trimmer};

/// One tier of the configured plan, as reported by [`MemoryManager::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierPlan {
    pub name: String,
    pub next: Option<String>,
    pub expiry_days: Option<u32>,
    pub trim_max_chars: Option<usize>,
    pub cluster: bool,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub owner: Option<String>,
    pub total: usize,
    /// Counts for every tier in storage, including unconfigured ones
    pub by_tier: BTreeMap<String, usize>,
    pub tiers: Vec<TierPlan>,
    /// Only reported for a single owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clusters: Option<usize>,
}

/// A record with its score explained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inspection {
    pub record: MemoryRecord,
    pub score: ScoreBreakdown,
    pub next_tier: Option<String>,
    /// When the record becomes old enough to migrate
    pub migrates_at: Option<DateTime<Utc>>,
}

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    config: MemtierConfig,
    scoring: ScoringEngine,
    retriever: Retriever,
    executor: PolicyExecutor,
    assembler: ContextAssembler,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("retriever", &self.retriever)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Build every component from `config`.
    pub fn new(store: Arc<dyn MemoryStore>, config: MemtierConfig) -> MemtierResult<Self> {
        let scoring = ScoringEngine::new(config.scoring);
        let trimmer = build_trimmer(&config.text_processing.trimmer);
        let summarizer = build_summarizer(&config.text_processing.summarizer);
        Self::with_components(store, config, scoring, trimmer, summarizer)
    }

    /// Build with caller-supplied scoring rules and text processors.
    pub fn with_components(
        store: Arc<dyn MemoryStore>,
        config: MemtierConfig,
        scoring: ScoringEngine,
        trimmer: Arc<dyn Trimmer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> MemtierResult<Self> {
        let metrics = Arc::new(Metrics::new());
        let executor = PolicyExecutor::new(store.clone(), config.clone(), trimmer, summarizer)?
            .with_metrics(metrics.clone());
        let retriever = Retriever::new(store.clone(), scoring.clone(), config.recall)
            .with_metrics(metrics.clone());
        Ok(Self {
            store,
            config,
            scoring,
            retriever,
            executor,
            assembler: ContextAssembler::default(),
            metrics,
        })
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn config(&self) -> &MemtierConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn executor(&self) -> &PolicyExecutor {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Score, route and store a new memory.
    ///
    /// An explicit tier must exist in the configuration. Without one the
    /// first matching write rule decides, else the first tier.
    #[instrument(skip(self, memory), fields(owner = %memory.owner))]
    pub async fn save(&self, mut memory: NewMemory) -> MemtierResult<MemoryId> {
        if memory.namespace.is_none() {
            memory.namespace = self.config.privacy.default_namespace.clone();
        }

        let score = match memory.score {
            Some(score) => score,
            None => {
                let preview = memory.clone().into_record(MemoryId(0), Utc::now());
                self.scoring.compute(&preview, preview.created_at)
            }
        };
        memory.score = Some(score);

        let tier = match memory.tier.take() {
            Some(tier) if self.config.tier(&tier).is_none() => {
                return Err(MemtierError::UnknownTier(tier));
            }
            Some(tier) => tier,
            None => self.config.write_tier(score).to_string(),
        };
        memory.tier = Some(tier.clone());

        let id = self.store.insert(memory).await?;
        debug!(memory_id = %id, tier = %tier, score, "memory saved");
        Ok(id)
    }

    pub async fn recall(&self, request: &SearchRequest) -> MemtierResult<Vec<ScoredMemory>> {
        self.retriever.search(request).await
    }

    /// Recall, then assemble the hits for a prompt.
    pub async fn recall_context(
        &self,
        request: &SearchRequest,
        format: ContextFormat,
    ) -> MemtierResult<AssembledContext> {
        let hits = self.recall(request).await?;
        Ok(self.assembler.assemble(
            &hits,
            request.thread.as_deref(),
            request.owner.as_deref(),
            format,
        ))
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub async fn run_policies(&self, owner: Option<&str>) -> PolicyRunSummary {
        self.executor.run(owner).await
    }

    pub async fn rebuild_clusters(&self, owner: &str) -> MemtierResult<usize> {
        self.executor.clustering().rebuild(owner).await
    }

    pub async fn clusters(
        &self,
        owner: &str,
        topic: Option<&str>,
        limit: usize,
    ) -> MemtierResult<Vec<ClusterRecord>> {
        Ok(self.store.list_clusters(owner, topic, limit).await?)
    }

    /// Tier counts and the configured tier plan.
    pub async fn stats(&self, owner: Option<&str>) -> MemtierResult<MemoryStats> {
        let by_tier = self.store.count_by_tier(owner).await?;
        let tiers = self
            .config
            .storage
            .tiers
            .iter()
            .enumerate()
            .map(|(idx, tier)| TierPlan {
                name: tier.name.clone(),
                next: self
                    .config
                    .storage
                    .tiers
                    .get(idx + 1)
                    .map(|t| t.name.clone()),
                expiry_days: tier.migration_days(),
                trim_max_chars: tier.trim.map(|t| t.max_chars),
                cluster: tier.cluster,
                records: by_tier.get(&tier.name).copied().unwrap_or(0),
            })
            .collect();
        let clusters = match owner {
            Some(owner) => Some(
                self.store
                    .list_clusters(owner, None, self.config.policies.batch_limit)
                    .await?
                    .len(),
            ),
            None => None,
        };
        Ok(MemoryStats {
            owner: owner.map(str::to_string),
            total: by_tier.values().sum(),
            by_tier,
            tiers,
            clusters,
        })
    }

    /// Explain a record's current score and migration schedule.
    pub async fn inspect(&self, id: MemoryId) -> MemtierResult<Option<Inspection>> {
        self.inspect_at(id, Utc::now()).await
    }

    pub async fn inspect_at(
        &self,
        id: MemoryId,
        now: DateTime<Utc>,
    ) -> MemtierResult<Option<Inspection>> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(None);
        };
        let score = self.scoring.breakdown(&record, now);
        let (next_tier, migrates_at) = match self.config.tier(&record.tier) {
            Some(tier) => {
                let next = self.config.next_tier(&tier.name)?.map(str::to_string);
                let due = match (&next, tier.migration_days()) {
                    (Some(_), Some(days)) => {
                        Some(record.updated_at + Duration::days(i64::from(days)))
                    }
                    _ => None,
                };
                (next, due)
            }
            None => (None, None),
        };
        Ok(Some(Inspection {
            record,
            score,
            next_tier,
            migrates_at,
        }))
    }
}
