//! Structured observability hooks for the target lifecycle.
//!
//! This module provides:
//! - A target-scoped tracing span for `Instrument`
//! - Emission functions for run and target lifecycle events
//!
//! Events are emitted at `info!` level, failures at `warn!`/`error!`.
//! Verbosity follows `RUST_LOG`; pass `--json` to the CLI for JSON lines.

use tracing::{error, info, warn};

/// Span covering one target's lifecycle; attach with `Instrument`.
///
/// # Example
///
/// ```ignore
/// run_target(spec).instrument(target_span(run_id.as_str(), &spec.name)).await
/// ```
pub fn target_span(run_id: &str, target: &str) -> tracing::Span {
    tracing::info_span!("blobcheck.target", run_id = %run_id, target = %target)
}

/// Emit event: run started with the number of configured targets.
pub fn emit_run_started(run_id: &str, configured: usize) {
    info!(event = "run.started", run_id = %run_id, configured = configured);
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, configured: usize, completed: usize, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        configured = configured,
        completed = completed,
        duration_ms = duration_ms,
    );
}

/// Emit event: lifecycle state transition.
pub fn emit_state_transition(target: &str, from: &str, to: &str) {
    info!(event = "target.transition", target = %target, from = %from, to = %to);
}

/// Emit event: target became ready.
pub fn emit_target_ready(target: &str, base_url: &str, startup_ms: u64) {
    info!(
        event = "target.ready",
        target = %target,
        base_url = %base_url,
        startup_ms = startup_ms,
    );
}

/// Emit event: a per-target fatal error; the run continues.
pub fn emit_target_failed(target: &str, class: &str, cause: &str) {
    error!(event = "target.failed", target = %target, class = %class, cause = %cause);
}

/// Emit event: target finished with its summary counts.
pub fn emit_target_completed(target: &str, passed: usize, failed: usize, skipped: usize) {
    info!(
        event = "target.completed",
        target = %target,
        passed = passed,
        failed = failed,
        skipped = skipped,
    );
}

/// Emit event: a cleanup tier failed. Never propagated.
pub fn emit_cleanup_failed(target: &str, tier: &str, cause: &str) {
    warn!(event = "target.cleanup_failed", target = %target, tier = %tier, cause = %cause);
}
