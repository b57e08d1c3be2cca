use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Engine activity counters. One instance is shared by everything driving
/// runs for a single engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub steps_executed: AtomicU64,
    pub steps_replayed: AtomicU64,
    pub step_retries: AtomicU64,
    pub step_failures: AtomicU64,
    pub callbacks_delivered: AtomicU64,
    pub callbacks_timed_out: AtomicU64,
    pub late_resolutions: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_replayed(&self) {
        self.steps_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_failure(&self) {
        self.step_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_delivered(&self) {
        self.callbacks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_timed_out(&self) {
        self.callbacks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_resolution(&self) {
        self.late_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_replayed: self.steps_replayed.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            step_failures: self.step_failures.load(Ordering::Relaxed),
            callbacks_delivered: self.callbacks_delivered.load(Ordering::Relaxed),
            callbacks_timed_out: self.callbacks_timed_out.load(Ordering::Relaxed),
            late_resolutions: self.late_resolutions.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine metrics: steps={}, replayed={}, retries={}, step_failures={}, delivered={}, timed_out={}, late={}, completed={}, failed={}",
            stats.steps_executed,
            stats.steps_replayed,
            stats.step_retries,
            stats.step_failures,
            stats.callbacks_delivered,
            stats.callbacks_timed_out,
            stats.late_resolutions,
            stats.runs_completed,
            stats.runs_failed
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub steps_executed: u64,
    pub steps_replayed: u64,
    pub step_retries: u64,
    pub step_failures: u64,
    pub callbacks_delivered: u64,
    pub callbacks_timed_out: u64,
    pub late_resolutions: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
