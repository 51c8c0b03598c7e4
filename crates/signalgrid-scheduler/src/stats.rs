//! Lock-free evaluation counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::outcome::{EvaluationOutcome, SkipReason};

/// Running totals across all intersections, updated by every evaluation.
#[derive(Debug, Default)]
pub struct EvaluationStats {
    advanced: AtomicU64,
    extended: AtomicU64,
    skipped_in_progress: AtomicU64,
    skipped_not_due: AtomicU64,
    skipped_conflict: AtomicU64,
    observer_fallbacks: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`EvaluationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub advanced: u64,
    pub extended: u64,
    pub skipped_in_progress: u64,
    pub skipped_not_due: u64,
    pub skipped_conflict: u64,
    pub observer_fallbacks: u64,
    pub failures: u64,
}

impl StatsSnapshot {
    pub fn committed(&self) -> u64 {
        self.advanced + self.extended
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_in_progress + self.skipped_not_due + self.skipped_conflict
    }
}

impl EvaluationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an outcome. `extended` says whether a commit kept the same phase.
    pub fn record_outcome(&self, outcome: &EvaluationOutcome, extended: bool) {
        let counter = match outcome {
            EvaluationOutcome::Committed(_) if extended => &self.extended,
            EvaluationOutcome::Committed(_) => &self.advanced,
            EvaluationOutcome::Skipped(SkipReason::AlreadyInProgress) => {
                &self.skipped_in_progress
            }
            EvaluationOutcome::Skipped(SkipReason::NotDue) => &self.skipped_not_due,
            EvaluationOutcome::Skipped(SkipReason::ConcurrentUpdate) => &self.skipped_conflict,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.observer_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            advanced: self.advanced.load(Ordering::Relaxed),
            extended: self.extended.load(Ordering::Relaxed),
            skipped_in_progress: self.skipped_in_progress.load(Ordering::Relaxed),
            skipped_not_due: self.skipped_not_due.load(Ordering::Relaxed),
            skipped_conflict: self.skipped_conflict.load(Ordering::Relaxed),
            observer_fallbacks: self.observer_fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
