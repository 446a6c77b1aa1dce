//! Relevance scoring.
//!
//! `ScoringEngine::compute` maps a record and a reference time to an integer
//! in `[0, 100]`. Three normalized components are blended by the configured
//! weights:
//!
//! - importance: `{low: 3, medium: 5, high: 8, critical: 10} / 10`
//! - recency: `1 - clamp(age / decay_window, 0, 1)`
//! - repetition: `1 - clamp(seen_count / 20, 0, 1)`
//!
//! The blend is clamped to `[0, 1]` and scaled to 100, custom rule bonuses are
//! added, and the total is clamped to `[0, 100]` and rounded half-to-even.
//! The function is pure: no clock reads, no randomness, no shared state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use memtier_store::MemoryRecord;
use serde::Serialize;
use tracing::warn;

use crate::config::ScoringConfig;

/// Repetition count at which the repetition component reaches zero.
const REPETITION_SATURATION: f64 = 20.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Additive scoring rule.
///
/// Rules must be pure. A rule that returns `Err` or a non-finite value
/// contributes nothing; the remaining rules and the base score still apply.
pub trait ScoringRule: Send + Sync {
    fn bonus(&self, record: &MemoryRecord) -> anyhow::Result<f64>;

    /// Label used in logs when the rule fails.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ScoringRule for F
where
    F: Fn(&MemoryRecord) -> anyhow::Result<f64> + Send + Sync,
{
    fn bonus(&self, record: &MemoryRecord) -> anyhow::Result<f64> {
        self(record)
    }
}

/// Per-component view of a score, for explanations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub importance: f64,
    pub recency: f64,
    pub repetition: f64,
    /// Weighted blend scaled to 0..=100, before rules
    pub base: f64,
    pub bonus: f64,
    pub total: u8,
}

/// Deterministic relevance scorer.
#[derive(Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
    rules: Vec<Arc<dyn ScoringRule>>,
}

impl fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringEngine")
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
        }
    }

    /// Append a rule; rules are evaluated in registration order.
    pub fn with_rule(mut self, rule: impl ScoringRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Append a closure rule.
    pub fn with_rule_fn<F>(self, rule: F) -> Self
    where
        F: Fn(&MemoryRecord) -> anyhow::Result<f64> + Send + Sync + 'static,
    {
        self.with_rule(rule)
    }

    pub fn add_rule(&mut self, rule: Arc<dyn ScoringRule>) {
        self.rules.push(rule);
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score `record` as of `now`.
    pub fn compute(&self, record: &MemoryRecord, now: DateTime<Utc>) -> u8 {
        self.breakdown(record, now).total
    }

    pub fn breakdown(&self, record: &MemoryRecord, now: DateTime<Utc>) -> ScoreBreakdown {
        let importance = f64::from(record.metadata.importance().weight()) / 10.0;
        let recency = self.recency(record.last_seen(), now);
        let repetition =
            1.0 - (record.metadata.seen_count() as f64 / REPETITION_SATURATION).clamp(0.0, 1.0);

        let c = &self.config;
        let blend = c.importance_weight * importance
            + c.recency_weight * recency
            + c.repetition_weight * repetition;
        let base = if blend.is_finite() {
            blend.clamp(0.0, 1.0) * 100.0
        } else {
            0.0
        };

        let bonus = self.rule_bonus(record);
        let total = (base + bonus).clamp(0.0, 100.0).round_ties_even() as u8;

        ScoreBreakdown {
            importance,
            recency,
            repetition,
            base,
            bonus,
            total,
        }
    }

    fn recency(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - last_seen).num_milliseconds() as f64 / 1000.0;
        let window = self.config.decay_days * SECONDS_PER_DAY;
        if !(window.is_finite() && window > 0.0) {
            return if age_secs <= 0.0 { 1.0 } else { 0.0 };
        }
        1.0 - (age_secs / window).clamp(0.0, 1.0)
    }

    fn rule_bonus(&self, record: &MemoryRecord) -> f64 {
        let mut total = 0.0;
        for rule in &self.rules {
            match rule.bonus(record) {
                Ok(b) if b.is_finite() => total += b,
                Ok(b) => {
                    warn!(rule = rule.name(), memory_id = %record.id, bonus = b, "scoring rule returned a non-finite bonus");
                }
                Err(e) => {
                    warn!(rule = rule.name(), memory_id = %record.id, error = %e, "scoring rule failed");
                }
            }
        }
        // Sum of finite bonuses can still overflow to infinity.
        if total.is_finite() {
            total
        } else if total > 0.0 {
            f64::MAX
        } else {
            f64::MIN
        }
    }
}
