//! Global atomic counters for Tower Siege observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the controller does this at the end of every run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    events_appended: AtomicU64,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    sandboxes_created: AtomicU64,
    teardown_failures: AtomicU64,
    provider_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_appended: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            sandboxes_created: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_events_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_appended", "counter incremented");
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_finished", "counter incremented");
    }

    pub fn inc_sandboxes_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandboxes_created", "counter incremented");
    }

    pub fn inc_teardown_failures(&self) {
        self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "teardown_failures", "counter incremented");
    }

    pub fn inc_provider_errors(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "provider_errors", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_appended = self.events_appended(),
            runs_started = self.runs_started(),
            runs_finished = self.runs_finished(),
            sandboxes_created = self.sandboxes_created(),
            teardown_failures = self.teardown_failures(),
            provider_errors = self.provider_errors(),
        );
    }

    pub fn events_appended(&self) -> u64 {
        self.events_appended.load(Ordering::Relaxed)
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_finished(&self) -> u64 {
        self.runs_finished.load(Ordering::Relaxed)
    }

    pub fn sandboxes_created(&self) -> u64 {
        self.sandboxes_created.load(Ordering::Relaxed)
    }

    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.load(Ordering::Relaxed)
    }

    pub fn provider_errors(&self) -> u64 {
        self.provider_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.events_appended.store(0, Ordering::Relaxed);
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_finished.store(0, Ordering::Relaxed);
        self.sandboxes_created.store(0, Ordering::Relaxed);
        self.teardown_failures.store(0, Ordering::Relaxed);
        self.provider_errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.events_appended(), 0);
        m.inc_events_appended();
        m.inc_events_appended();
        assert_eq!(m.events_appended(), 2);

        m.inc_runs_started();
        m.inc_runs_finished();
        assert_eq!(m.runs_started(), 1);
        assert_eq!(m.runs_finished(), 1);

        m.inc_teardown_failures();
        m.inc_provider_errors();
        m.inc_provider_errors();
        assert_eq!(m.teardown_failures(), 1);
        assert_eq!(m.provider_errors(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_events_appended();
        m.inc_sandboxes_created();
        m.inc_provider_errors();
        m.reset();
        assert_eq!(m.events_appended(), 0);
        assert_eq!(m.sandboxes_created(), 0);
        assert_eq!(m.provider_errors(), 0);
    }
}
