//! Structured observability hooks for the battle lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via [`run_span`]
//! - Emission functions for run start/finish, event appends, and sandbox churn
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::info;

/// Run-scoped span. Attach it to the run's task with
/// [`tracing::Instrument::instrument`] so every event from the controller,
/// monitor and runners carries `run_id`.
///
/// # Example
///
/// ```ignore
/// tokio::spawn(controller.execute(run).instrument(obs::run_span("3f0c...")));
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("siege.run", run_id = %run_id)
}

/// Emit event: run started with its agent count.
pub fn emit_run_started(run_id: &str, agent_count: usize) {
    info!(event = "run.started", run_id = %run_id, agent_count = agent_count);
}

/// Emit event: run finished with duration, final health, and outcome.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, final_health: u32, cancelled: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        final_health = final_health,
        cancelled = cancelled,
    );
}

/// Emit event: a single event appended to the run.
pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    tracing::debug!(event = "run.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

/// Emit event: a sandbox was provisioned.
pub fn emit_sandbox_created(run_id: &str, role: &str, sandbox_id: &str) {
    info!(
        event = "sandbox.created",
        run_id = %run_id,
        role = %role,
        sandbox_id = %sandbox_id,
    );
}

/// Emit event: a sandbox was torn down.
pub fn emit_sandbox_destroyed(run_id: &str, role: &str, sandbox_id: &str) {
    info!(
        event = "sandbox.destroyed",
        run_id = %run_id,
        role = %role,
        sandbox_id = %sandbox_id,
    );
}

/// Emit event: sandbox teardown failed (warning level).
pub fn emit_teardown_error(run_id: &str, sandbox_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "sandbox.teardown_error",
        run_id = %run_id,
        sandbox_id = %sandbox_id,
        error = %error,
    );
}
