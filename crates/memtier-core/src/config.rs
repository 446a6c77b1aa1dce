//! Engine configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then runtime overrides. Tables merge key by key; arrays and scalars from a
//! later layer replace the earlier value wholesale (so a file that lists
//! `[[storage.tiers]]` replaces the default tier list). The merged document
//! is deserialized and validated before use.

use std::path::Path;

use memtier_store::DEFAULT_TIER;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MemtierError, MemtierResult};
use crate::retriever::Scope;

/// Env var that promotes configuration warnings to errors.
pub const STRICT_ENV: &str = "MEMTIER_STRICT_CONFIG";

/// Weight sums further than this from 1.0 produce a warning.
const WEIGHT_SUM_TOLERANCE: f64 = 0.15;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemtierConfig {
    pub storage: StorageConfig,
    pub scoring: ScoringConfig,
    pub summarization: SummarizationConfig,
    pub recall: RecallConfig,
    pub clustering: ClusteringConfig,
    pub aggregation: AggregationConfig,
    pub policies: PoliciesConfig,
    pub text_processing: TextProcessingConfig,
    pub privacy: PrivacyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Ordered retention tiers; records only ever move forward in this list.
    pub tiers: Vec<TierConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig::new("short_term").with_expiry_days(7),
                TierConfig::new("mid_term").with_expiry_days(30),
                TierConfig::new("long_term").with_trim(1000),
            ],
        }
    }
}

/// One retention tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Age in days after which records move to the next tier; 0 or absent disables migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimConfig>,
    /// Records in this tier feed cluster rebuilds.
    #[serde(default)]
    pub cluster: bool,
}

impl TierConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expiry_days: None,
            trim: None,
            cluster: false,
        }
    }

    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = Some(days);
        self
    }

    pub fn with_trim(mut self, max_chars: usize) -> Self {
        self.trim = Some(TrimConfig { max_chars });
        self
    }

    pub fn with_cluster(mut self, cluster: bool) -> Self {
        self.cluster = cluster;
        self
    }

    /// Migration threshold, if migration is enabled for this tier.
    pub fn migration_days(&self) -> Option<u32> {
        self.expiry_days.filter(|&d| d > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimConfig {
    pub max_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub importance_weight: f64,
    pub recency_weight: f64,
    pub repetition_weight: f64,
    /// Age at which the recency component reaches zero.
    pub decay_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            importance_weight: 0.5,
            recency_weight: 0.3,
            repetition_weight: 0.2,
            decay_days: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub min_chars: usize,
    pub target_chars: usize,
    pub mark_summarized: bool,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_chars: 600,
            target_chars: 300,
            mark_summarized: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub default_top_k: usize,
    /// Scope used when a request names none.
    pub scope: Scope,
    /// Storage-side cap on candidates fetched before ranking.
    pub candidate_limit: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            scope: Scope::Thread,
            candidate_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Rebuild clusters at the end of every policy run.
    pub enabled: bool,
    pub min_cluster_size: usize,
    pub summary_chars: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cluster_size: 1,
            summary_chars: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Un-summarized members a thread needs before it is aggregated.
    pub min_thread_records: usize,
    pub summary_chars: usize,
    /// Members fetched per thread per run.
    pub batch_size: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_thread_records: 10,
            summary_chars: 1000,
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    /// Fetch cap for every batch step of a policy run.
    pub batch_limit: usize,
    /// Interval between scheduled runs in `memtierd`.
    pub schedule_minutes: u64,
    /// Write routing rules, first match wins.
    pub write: Vec<WriteRule>,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            batch_limit: 1000,
            schedule_minutes: 60,
            write: Vec::new(),
        }
    }
}

/// Route new records with `score >= min_score` (0..=100) to tier `to`.
/// A rule without `min_score` always matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<u8>,
    pub to: String,
}

impl WriteRule {
    pub fn matches(&self, score: u8) -> bool {
        self.min_score.map_or(true, |min| score >= min)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextProcessingConfig {
    pub trimmer: TrimmerConfig,
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimmerKind {
    #[default]
    Simple,
    #[serde(alias = "disabled", alias = "none")]
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimmerConfig {
    #[serde(rename = "type")]
    pub kind: TrimmerKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerKind {
    #[default]
    Simple,
    #[serde(alias = "disabled", alias = "none")]
    Noop,
    /// Remote chat-completions endpoint with local fallback
    #[serde(alias = "llm")]
    Enrichment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    #[serde(rename = "type")]
    pub kind: SummarizerKind,
    pub endpoint: String,
    pub model: String,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            kind: SummarizerKind::Simple,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Namespace applied to saves that name none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
}

impl MemtierConfig {
    /// Load defaults, then `path` (if any), then `overrides` (if any), and validate.
    pub fn load(path: Option<&Path>, overrides: Option<toml::Value>) -> MemtierResult<Self> {
        let mut layers = Vec::new();
        if let Some(path) = path {
            debug!(path = %path.display(), "loading config file");
            let text = std::fs::read_to_string(path)?;
            layers.push(toml::from_str::<toml::Value>(&text)?);
        }
        layers.extend(overrides);
        Self::from_layers(layers)
    }

    /// Parse a TOML document layered over the defaults, and validate.
    pub fn from_toml_str(text: &str) -> MemtierResult<Self> {
        Self::from_layers(vec![toml::from_str::<toml::Value>(text)?])
    }

    fn from_layers(layers: Vec<toml::Value>) -> MemtierResult<Self> {
        let mut merged = toml::Value::try_from(Self::default())?;
        for layer in layers {
            merge_values(&mut merged, layer);
        }
        let config: Self = merged.try_into()?;

        let warnings = config.validate()?;
        for warning in &warnings {
            warn!(event = "config.warning", warning = %warning);
        }
        if strict_from_env() && !warnings.is_empty() {
            return Err(MemtierError::Config(warnings.join("; ")));
        }
        Ok(config)
    }

    /// Render as TOML (used by `memtier init-config`).
    pub fn to_toml_string(&self) -> MemtierResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check invariants. Hard violations are errors; soft ones are returned as warnings.
    pub fn validate(&self) -> MemtierResult<Vec<String>> {
        fn fail(msg: String) -> MemtierResult<Vec<String>> {
            Err(MemtierError::Config(msg))
        }

        let mut warnings = Vec::new();

        // Tiers
        if self.storage.tiers.is_empty() {
            return fail("storage.tiers must list at least one tier".into());
        }
        let mut seen = std::collections::HashSet::new();
        for (i, tier) in self.storage.tiers.iter().enumerate() {
            if tier.name.trim().is_empty() {
                return fail(format!("storage.tiers[{i}] has an empty name"));
            }
            if !seen.insert(tier.name.as_str()) {
                return fail(format!("duplicate tier name: {}", tier.name));
            }
            if tier.trim.is_some_and(|t| t.max_chars == 0) {
                return fail(format!("tier {}: trim.max_chars must be positive", tier.name));
            }
        }
        if let Some(last) = self.storage.tiers.last() {
            if last.migration_days().is_some() {
                warnings.push(format!(
                    "terminal tier {} declares expiry_days, which has no effect",
                    last.name
                ));
            }
        }

        // Scoring
        let s = &self.scoring;
        for (name, w) in [
            ("importance_weight", s.importance_weight),
            ("recency_weight", s.recency_weight),
            ("repetition_weight", s.repetition_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return fail(format!("scoring.{name} must be a non-negative number, got {w}"));
            }
            if w > 1.0 {
                warnings.push(format!("scoring.{name} = {w} is above 1.0"));
            }
        }
        let sum = s.importance_weight + s.recency_weight + s.repetition_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            warnings.push(format!("scoring weights sum to {sum:.2}, expected about 1.0"));
        }
        if !s.decay_days.is_finite() || s.decay_days <= 0.0 {
            return fail(format!("scoring.decay_days must be positive, got {}", s.decay_days));
        }

        // Recall
        if self.recall.default_top_k == 0 {
            return Err(MemtierError::InvalidTopK(0));
        }
        if self.recall.candidate_limit == 0 {
            return fail("recall.candidate_limit must be positive".into());
        }

        // Summarization / aggregation / clustering
        let sum_cfg = &self.summarization;
        if sum_cfg.enabled && sum_cfg.target_chars == 0 {
            return fail("summarization.target_chars must be positive when enabled".into());
        }
        if sum_cfg.enabled && sum_cfg.min_chars <= sum_cfg.target_chars {
            warnings.push(format!(
                "summarization.min_chars ({}) <= target_chars ({}); short records will be rewritten",
                sum_cfg.min_chars, sum_cfg.target_chars
            ));
        }
        let agg = &self.aggregation;
        if agg.min_thread_records == 0 || agg.batch_size == 0 || agg.summary_chars == 0 {
            return fail("aggregation thresholds must be positive".into());
        }
        if agg.batch_size < agg.min_thread_records {
            warnings.push(format!(
                "aggregation.batch_size ({}) < min_thread_records ({}); threads will never aggregate",
                agg.batch_size, agg.min_thread_records
            ));
        }
        if self.clustering.min_cluster_size == 0 {
            return fail("clustering.min_cluster_size must be positive".into());
        }

        // Policies
        if self.policies.batch_limit == 0 {
            return fail("policies.batch_limit must be positive".into());
        }
        if self.policies.schedule_minutes == 0 {
            return fail("policies.schedule_minutes must be positive".into());
        }
        for rule in &self.policies.write {
            if self.tier(&rule.to).is_none() {
                return Err(MemtierError::UnknownTier(rule.to.clone()));
            }
            if rule.min_score.is_some_and(|m| m > 100) {
                warnings.push(format!("write rule to {} can never match", rule.to));
            }
        }

        // Text processing
        let summarizer = &self.text_processing.summarizer;
        if summarizer.kind == SummarizerKind::Enrichment && summarizer.endpoint.trim().is_empty() {
            return fail("text_processing.summarizer.endpoint is required for enrichment".into());
        }

        Ok(warnings)
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.storage.tiers.iter().find(|t| t.name == name)
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.storage.tiers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Tier assigned to fresh records when no write rule matches.
    pub fn first_tier(&self) -> &str {
        self.storage
            .tiers
            .first()
            .map(|t| t.name.as_str())
            .unwrap_or(DEFAULT_TIER)
    }

    /// Last tier in the configured order.
    pub fn terminal_tier(&self) -> Option<&str> {
        self.storage.tiers.last().map(|t| t.name.as_str())
    }

    /// Immediate successor of `name`; `None` for the terminal tier.
    pub fn next_tier(&self, name: &str) -> MemtierResult<Option<&str>> {
        let idx = self
            .storage
            .tiers
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| MemtierError::UnknownTier(name.to_string()))?;
        Ok(self.storage.tiers.get(idx + 1).map(|t| t.name.as_str()))
    }

    /// Tier for a new record with the given score.
    pub fn write_tier(&self, score: u8) -> &str {
        self.policies
            .write
            .iter()
            .find(|rule| rule.matches(score))
            .map(|rule| rule.to.as_str())
            .unwrap_or_else(|| self.first_tier())
    }

    /// Tiers whose records feed cluster rebuilds; every tier when none is marked.
    pub fn cluster_tiers(&self) -> Vec<&str> {
        let marked: Vec<&str> = self
            .storage
            .tiers
            .iter()
            .filter(|t| t.cluster)
            .map(|t| t.name.as_str())
            .collect();
        if marked.is_empty() {
            self.tier_names()
        } else {
            marked
        }
    }
}

fn strict_from_env() -> bool {
    std::env::var(STRICT_ENV)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Recursively merge `over` into `base`. Tables merge; everything else replaces.
pub fn merge_values(base: &mut toml::Value, over: toml::Value) {
    match (base, over) {
        (toml::Value::Table(base_tbl), toml::Value::Table(over_tbl)) => {
            for (key, value) in over_tbl {
                match base_tbl.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_tbl.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Build an override document from `dotted.path=value`.
///
/// The value is parsed as a TOML literal when possible (`5`, `true`,
/// `"text"`, `[1, 2]`), otherwise taken as a bare string.
pub fn override_from_pair(pair: &str) -> MemtierResult<toml::Value> {
    let (path, raw) = pair
        .split_once('=')
        .ok_or_else(|| MemtierError::Config(format!("override {pair:?} is not key=value")))?;
    let path = path.trim();
    if path.is_empty() || path.split('.').any(|seg| seg.trim().is_empty()) {
        return Err(MemtierError::Config(format!("override {pair:?} has an empty key")));
    }

    let raw = raw.trim();
    let value = toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()));

    let mut doc = value;
    for segment in path.rsplit('.') {
        let mut table = toml::Table::new();
        table.insert(segment.trim().to_string(), doc);
        doc = toml::Value::Table(table);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MemtierConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(config.tier_names(), vec!["short_term", "mid_term", "long_term"]);
        assert_eq!(config.terminal_tier(), Some("long_term"));
    }

    #[test]
    fn next_tier_walks_forward() {
        let config = MemtierConfig::default();
        assert_eq!(config.next_tier("short_term").unwrap(), Some("mid_term"));
        assert_eq!(config.next_tier("mid_term").unwrap(), Some("long_term"));
        assert_eq!(config.next_tier("long_term").unwrap(), None);
        assert!(matches!(
            config.next_tier("archive"),
            Err(MemtierError::UnknownTier(_))
        ));
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let config = MemtierConfig::from_toml_str(
            r#"
            [recall]
            default_top_k = 5

            [scoring]
            decay_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.recall.default_top_k, 5);
        assert_eq!(config.recall.candidate_limit, 1000);
        assert_eq!(config.scoring.decay_days, 30.0);
        assert_eq!(config.scoring.importance_weight, 0.5);
        assert_eq!(config.storage.tiers.len(), 3);
    }

    #[test]
    fn tier_list_replaces_defaults() {
        let config = MemtierConfig::from_toml_str(
            r#"
            [[storage.tiers]]
            name = "hot"
            expiry_days = 1

            [[storage.tiers]]
            name = "cold"
            trim = { max_chars = 200 }
            "#,
        )
        .unwrap();
        assert_eq!(config.tier_names(), vec!["hot", "cold"]);
        assert_eq!(config.tier("cold").unwrap().trim, Some(TrimConfig { max_chars: 200 }));
    }

    #[test]
    fn duplicate_tier_names_fail() {
        let err = MemtierConfig::from_toml_str(
            r#"
            [[storage.tiers]]
            name = "a"
            [[storage.tiers]]
            name = "a"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MemtierError::Config(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn negative_expiry_fails_to_parse() {
        let err = MemtierConfig::from_toml_str(
            r#"
            [[storage.tiers]]
            name = "a"
            expiry_days = -1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MemtierError::ConfigParse(_)));
    }

    #[test]
    fn unknown_scope_fails_to_parse() {
        let err = MemtierConfig::from_toml_str("[recall]\nscope = \"galaxy\"\n").unwrap_err();
        assert!(matches!(err, MemtierError::ConfigParse(_)));
    }

    #[test]
    fn zero_top_k_is_rejected() {
        let err = MemtierConfig::from_toml_str("[recall]\ndefault_top_k = 0\n").unwrap_err();
        assert!(matches!(err, MemtierError::InvalidTopK(0)));
    }

    #[test]
    fn write_rule_to_unknown_tier_fails() {
        let err = MemtierConfig::from_toml_str(
            r#"
            [[policies.write]]
            min_score = 80
            to = "vault"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MemtierError::UnknownTier(t) if t == "vault"));
    }

    #[test]
    fn unbalanced_weights_warn() {
        let mut config = MemtierConfig::default();
        config.scoring.importance_weight = 0.9;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("sum to")));
    }

    #[test]
    fn write_tier_uses_first_matching_rule() {
        let mut config = MemtierConfig::default();
        config.policies.write = vec![
            WriteRule {
                min_score: Some(80),
                to: "long_term".into(),
            },
            WriteRule {
                min_score: None,
                to: "short_term".into(),
            },
        ];
        assert_eq!(config.write_tier(90), "long_term");
        assert_eq!(config.write_tier(10), "short_term");

        config.policies.write.clear();
        assert_eq!(config.write_tier(90), "short_term");
    }

    #[test]
    fn cluster_tiers_fall_back_to_all() {
        let mut config = MemtierConfig::default();
        assert_eq!(config.cluster_tiers().len(), 3);
        config.storage.tiers[2].cluster = true;
        assert_eq!(config.cluster_tiers(), vec!["long_term"]);
    }

    #[test]
    fn overrides_parse_typed_values() {
        let value = override_from_pair("recall.default_top_k=3").unwrap();
        let config = MemtierConfig::load(None, Some(value)).unwrap();
        assert_eq!(config.recall.default_top_k, 3);

        let value = override_from_pair("privacy.default_namespace=tenant-a").unwrap();
        let config = MemtierConfig::load(None, Some(value)).unwrap();
        assert_eq!(config.privacy.default_namespace.as_deref(), Some("tenant-a"));

        assert!(override_from_pair("novalue").is_err());
        assert!(override_from_pair("a..b=1").is_err());
    }

    #[test]
    fn rendered_defaults_load_back() {
        let text = MemtierConfig::default().to_toml_string().unwrap();
        let config = MemtierConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, MemtierConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memtier.toml");
        std::fs::write(&path, "[summarization]\nenabled = true\n").unwrap();
        let config = MemtierConfig::load(Some(&path), None).unwrap();
        assert!(config.summarization.enabled);
    }
}
