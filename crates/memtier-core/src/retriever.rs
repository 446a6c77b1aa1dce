//! Scope-aware retrieval.
//!
//! A [`SearchRequest`] is resolved into a [`MemoryFilter`] according to its
//! [`Scope`], candidates are fetched (summarized records excluded, capped at
//! `recall.candidate_limit`), scored, stably sorted by descending score and
//! truncated to `top_k`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use memtier_store::{
    MemoryFilter, MemoryRecord, MemoryStore, Metadata, SummarizedFilter, KEY_TOPIC,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::RecallConfig;
use crate::error::{MemtierError, MemtierResult};
use crate::metrics::Metrics;
use crate::obs;
use crate::scoring::ScoringEngine;

/// Breadth of a retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Owner + thread
    #[default]
    Thread,
    /// Owner + every thread that shares `metadata.topic`
    Topic,
    /// Every record of the owner
    #[serde(alias = "owner")]
    User,
    /// Every record of every owner; administrative use only
    Global,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Thread => "thread",
            Scope::Topic => "topic",
            Scope::User => "user",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = MemtierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Scope::Thread),
            "topic" => Ok(Scope::Topic),
            "user" | "owner" => Ok(Scope::User),
            "global" => Ok(Scope::Global),
            _ => Err(MemtierError::UnknownScope(s.to_string())),
        }
    }
}

/// Parameters of one retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub owner: Option<String>,
    pub thread: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Falls back to `recall.scope`
    pub scope: Option<Scope>,
    pub namespace: Option<String>,
    /// Falls back to `recall.default_top_k`
    pub top_k: Option<usize>,
}

impl SearchRequest {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Default::default()
        }
    }

    /// Request with no owner, for administrative global scans.
    pub fn global() -> Self {
        Self {
            scope: Some(Scope::Global),
            ..Default::default()
        }
    }

    pub fn thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// A retrieved record and the score it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub score: u8,
    pub record: MemoryRecord,
}

/// Read-only ranked retrieval over a [`MemoryStore`].
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn MemoryStore>,
    scoring: ScoringEngine,
    config: RecallConfig,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for Retriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("scoring", &self.scoring)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Retriever {
    pub fn new(store: Arc<dyn MemoryStore>, scoring: ScoringEngine, config: RecallConfig) -> Self {
        Self {
            store,
            scoring,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// Search as of the wall clock.
    pub async fn search(&self, request: &SearchRequest) -> MemtierResult<Vec<ScoredMemory>> {
        self.search_at(request, Utc::now()).await
    }

    /// Search, scoring against `now`.
    #[instrument(skip(self, request), fields(owner = ?request.owner, scope = tracing::field::Empty))]
    pub async fn search_at(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> MemtierResult<Vec<ScoredMemory>> {
        let started = Instant::now();
        let scope = request.scope.unwrap_or(self.config.scope);
        tracing::Span::current().record("scope", scope.as_str());

        let top_k = match request.top_k {
            Some(0) => return Err(MemtierError::InvalidTopK(0)),
            Some(k) => k,
            None => self.config.default_top_k,
        };
        if top_k == 0 {
            return Err(MemtierError::InvalidTopK(0));
        }

        let filter = self.resolve(request, scope).await?;
        let candidates = self.store.query(&filter, self.config.candidate_limit).await?;
        debug!(candidates = candidates.len(), "fetched retrieval candidates");

        let mut ranked: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|record| ScoredMemory {
                score: self.scoring.compute(&record, now),
                record,
            })
            .collect();
        // sort_by is stable: equal scores keep storage order.
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked.truncate(top_k);

        let avg_score = if ranked.is_empty() {
            0.0
        } else {
            ranked.iter().map(|m| f64::from(m.score)).sum::<f64>() / ranked.len() as f64
        };
        obs::emit_retrieval_completed(
            filter.owner.as_deref(),
            scope.as_str(),
            ranked.len(),
            avg_score,
            started.elapsed().as_millis() as u64,
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_retrieval(ranked.len());
        }
        Ok(ranked)
    }

    /// Translate a request into a storage filter.
    async fn resolve(&self, request: &SearchRequest, scope: Scope) -> MemtierResult<MemoryFilter> {
        let mut filter = MemoryFilter {
            owner: request.owner.clone(),
            thread: request.thread.clone(),
            namespace: request.namespace.clone(),
            metadata: request.metadata.clone(),
            summarized: SummarizedFilter::Exclude,
            ..Default::default()
        };

        match scope {
            Scope::Thread => {
                require_owner(&filter, scope)?;
                if filter.thread.is_none() {
                    obs::emit_scope_warning(
                        scope.as_str(),
                        "thread scope without a thread; searching all of the owner's records",
                    );
                }
            }
            Scope::Topic => {
                let owner = require_owner(&filter, scope)?.to_string();
                match request.metadata.get(KEY_TOPIC).and_then(|v| v.as_str()) {
                    Some(topic) => {
                        filter.thread = None;
                        let threads = self
                            .store
                            .threads_by_topic(&owner, topic, self.config.candidate_limit)
                            .await?;
                        debug!(topic, threads = threads.len(), "resolved topic threads");
                        if !threads.is_empty() {
                            filter.threads_any_of = Some(threads);
                        }
                    }
                    None => {
                        obs::emit_scope_warning(
                            scope.as_str(),
                            "topic scope without metadata.topic; using thread scope",
                        );
                    }
                }
            }
            Scope::User => {
                require_owner(&filter, scope)?;
                filter.thread = None;
            }
            Scope::Global => {
                if filter.owner.is_some() {
                    obs::emit_scope_warning(
                        scope.as_str(),
                        "global scope ignores the supplied owner and bypasses owner isolation",
                    );
                }
                filter.owner = None;
                filter.thread = None;
            }
        }
        Ok(filter)
    }
}

fn require_owner(filter: &MemoryFilter, scope: Scope) -> MemtierResult<&str> {
    filter
        .owner
        .as_deref()
        .ok_or_else(|| MemtierError::MissingOwner {
            scope: scope.to_string(),
        })
}
