//! Structured observability hooks for retrieval and policy execution.
//!
//! Every function emits one `tracing` event with a stable `event` field so a
//! log pipeline can key on it. Verbosity follows `MEMTIER_LOG`; set
//! `MEMTIER_LOG_FORMAT=json` for machine-readable output.

use tracing::{info, warn};

/// Span covering one policy run.
///
/// Attach it to the run future with `.instrument(span.span())` so every
/// event the run emits carries `run_id` and `owner`.
pub struct PolicyRunSpan {
    span: tracing::Span,
}

impl PolicyRunSpan {
    pub fn new(run_id: &str, owner: Option<&str>) -> Self {
        let span = tracing::info_span!(
            "memtier.policy_run",
            run_id = %run_id,
            owner = owner.unwrap_or("*"),
        );
        Self { span }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

/// Emit event: retrieval completed.
pub fn emit_retrieval_completed(
    owner: Option<&str>,
    scope: &str,
    count: usize,
    avg_score: f64,
    duration_ms: u64,
) {
    info!(
        event = "retrieval.completed",
        owner = owner.unwrap_or("-"),
        scope = %scope,
        count = count,
        avg_score = avg_score,
        duration_ms = duration_ms,
    );
}

/// Emit event: a scope request was interpreted differently than asked.
pub fn emit_scope_warning(scope: &str, reason: &str) {
    warn!(event = "retrieval.scope_warning", scope = %scope, reason = %reason);
}

/// Emit event: one policy step finished.
pub fn emit_policy_step(kind: &str, tier: Option<&str>, affected: usize, params: &str) {
    info!(
        event = "policy.step",
        kind = %kind,
        tier = tier.unwrap_or("-"),
        affected = affected,
        params = %params,
    );
}

/// Emit event: a policy step failed; the run continues.
pub fn emit_policy_step_failed(kind: &str, tier: Option<&str>, error: &dyn std::fmt::Display) {
    warn!(
        event = "policy.step_failed",
        kind = %kind,
        tier = tier.unwrap_or("-"),
        error = %error,
    );
}

/// Emit event: policy run finished.
#[allow(clippy::too_many_arguments)]
pub fn emit_policy_run_finished(
    run_id: &str,
    owner: Option<&str>,
    migrated: usize,
    trimmed: usize,
    summarized: usize,
    thread_summaries: usize,
    clusters: usize,
    duration_ms: u64,
) {
    info!(
        event = "policy.run_finished",
        run_id = %run_id,
        owner = owner.unwrap_or("*"),
        migrated = migrated,
        trimmed = trimmed,
        summarized = summarized,
        thread_summaries = thread_summaries,
        clusters = clusters,
        duration_ms = duration_ms,
    );
}

/// Emit event: clusters rebuilt for an owner.
pub fn emit_cluster_rebuilt(owner: &str, clusters: usize, members: usize) {
    info!(
        event = "cluster.rebuilt",
        owner = %owner,
        clusters = clusters,
        members = members,
    );
}
