//! memtier-core: tiered memory lifecycle engine
//!
//! Re-exports the engine components for programmatic use.
//!
//! ## Components
//!
//! - `ScoringEngine`: deterministic 0..=100 relevance score with additive rules
//! - `Retriever`: thread/topic/user/global scoped, ranked recall
//! - `PolicyExecutor`: trim, migrate, summarize, aggregate threads, rebuild clusters
//! - `Clustering`: (topic, category) grouping with idempotent upserts
//! - `MemoryManager`: write path, recall, stats and inspection over one store

pub mod clustering;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod retriever;
pub mod scoring;
pub mod telemetry;
pub mod text;

pub use clustering::{group, ClusterDraft, Clustering};
pub use config::{
    merge_values, override_from_pair, AggregationConfig, ClusteringConfig, MemtierConfig,
    PoliciesConfig, PrivacyConfig, RecallConfig, ScoringConfig, StorageConfig,
    SummarizationConfig, SummarizerConfig, SummarizerKind, TextProcessingConfig, TierConfig,
    TrimConfig, TrimmerConfig, TrimmerKind, WriteRule,
};
pub use context::{AssembledContext, ChatMessage, ContextAssembler, ContextFormat, ContextStyle};
pub use error::{MemtierError, MemtierResult};
pub use manager::{Inspection, MemoryManager, MemoryStats, TierPlan};
pub use metrics::Metrics;
pub use policy::{PolicyExecutor, PolicyRunSummary};
pub use retriever::{Retriever, Scope, ScoredMemory, SearchRequest};
pub use scoring::{ScoreBreakdown, ScoringEngine, ScoringRule};
pub use text::{
    build_summarizer, build_trimmer, EnrichmentSummarizer, NoOpSummarizer, NoOpTrimmer,
    SimpleSummarizer, SimpleTrimmer, Summarizer, Trimmer,
};

pub use memtier_store::{
    ClusterId, ClusterRecord, InMemoryStore, MemoryFilter, MemoryId, MemoryRecord, MemoryStore,
    Metadata, NewMemory, SurrealMemoryStore,
};
