//! Scheduler: one leased, versioned evaluation per intersection.
//!
//! An evaluation:
//! - claims the intersection's lease, skipping if another run holds it
//! - reads the current signal state and skips if the phase is not due
//! - asks the traffic observer for densities, bounded by a timeout
//! - plans the next phase and commits it with compare-and-swap
//! - releases the lease
//!
//! The lease keeps overlapping triggers apart. The version check catches
//! any writer that slips past it (for example after a lease expired
//! mid-run). Infrastructure failures abort the run and leave the lease to
//! expire on its own.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use signal_core::{IntersectionSpec, PlanInput, PlanKind, epoch_millis};
use signalgrid_observer::{TrafficObserver, observe_within};
use signalgrid_state::{LeaseStore, SignalStore, StateResult, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::outcome::{EvaluationOutcome, SkipReason};
use crate::stats::EvaluationStats;

/// Default bound on a single state store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Evaluates intersections against a shared store and traffic observer.
///
/// Holds no per-intersection state of its own; every evaluation works from
/// a fresh snapshot read from the store.
pub struct Scheduler {
    signals: Arc<dyn SignalStore>,
    leases: Arc<dyn LeaseStore>,
    observer: Arc<dyn TrafficObserver>,
    store_timeout: Duration,
    stats: Arc<EvaluationStats>,
}

impl Scheduler {
    pub fn new(
        signals: Arc<dyn SignalStore>,
        leases: Arc<dyn LeaseStore>,
        observer: Arc<dyn TrafficObserver>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            signals,
            leases,
            observer,
            store_timeout,
            stats: Arc::new(EvaluationStats::new()),
        }
    }

    /// Scheduler backed by a single [`StateStore`] for state and leases.
    pub fn with_store(
        store: StateStore,
        observer: Arc<dyn TrafficObserver>,
        store_timeout: Duration,
    ) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store, observer, store_timeout)
    }

    pub fn stats(&self) -> &Arc<EvaluationStats> {
        &self.stats
    }

    /// Evaluate `id` at the current wall-clock time.
    pub async fn evaluate(&self, id: &str) -> SchedulerResult<EvaluationOutcome> {
        self.evaluate_at(id, epoch_millis()).await
    }

    /// Evaluate `id` as of `now_ms`.
    pub async fn evaluate_at(&self, id: &str, now_ms: u64) -> SchedulerResult<EvaluationOutcome> {
        let result = self.try_evaluate(id, now_ms).await;
        if let Err(e) = &result {
            self.stats.record_failure();
            error!(intersection = %id, error = %e, "evaluation failed");
        }
        result
    }

    /// Every provisioned intersection's spec. An intersection whose config
    /// cannot be read is logged and left out so the rest still get
    /// evaluated.
    pub async fn intersections(&self) -> SchedulerResult<Vec<IntersectionSpec>> {
        let signals = Arc::clone(&self.signals);
        self.blocking(move || {
            let mut specs = Vec::new();
            for id in signals.intersection_ids()? {
                match signals.intersection(&id) {
                    Ok(Some(spec)) => specs.push(spec),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(intersection = %id, error = %e, "skipping unreadable intersection config")
                    }
                }
            }
            Ok(specs)
        })
        .await
    }

    /// Sweep leases that expired before `now_ms`.
    pub async fn purge_expired_leases(&self, now_ms: u64) -> SchedulerResult<u32> {
        let leases = Arc::clone(&self.leases);
        self.blocking(move || leases.purge_expired(now_ms)).await
    }

    async fn try_evaluate(&self, id: &str, now_ms: u64) -> SchedulerResult<EvaluationOutcome> {
        let spec = {
            let signals = Arc::clone(&self.signals);
            let key = id.to_string();
            self.blocking(move || signals.intersection(&key))
                .await?
                .ok_or_else(|| SchedulerError::IntersectionNotFound(id.to_string()))?
        };

        let holder = Uuid::new_v4().to_string();
        let acquired = {
            let leases = Arc::clone(&self.leases);
            let (key, token, ttl) = (id.to_string(), holder.clone(), spec.lease_ttl);
            self.blocking(move || leases.try_acquire(&key, &token, ttl, now_ms))
                .await?
        };
        if !acquired {
            return Ok(self.skip(id, SkipReason::AlreadyInProgress));
        }

        // Errors return early and leave the lease held until it expires.
        let outcome = self.evaluate_leased(&spec, now_ms).await?;
        self.release(id, holder).await;
        Ok(outcome)
    }

    async fn evaluate_leased(
        &self,
        spec: &IntersectionSpec,
        now_ms: u64,
    ) -> SchedulerResult<EvaluationOutcome> {
        let state = {
            let signals = Arc::clone(&self.signals);
            let key = spec.id.clone();
            self.blocking(move || signals.read(&key))
                .await?
                .ok_or_else(|| SchedulerError::NotProvisioned(spec.id.clone()))?
        };

        if !state.is_due(now_ms) {
            return Ok(self.skip(&spec.id, SkipReason::NotDue));
        }

        let observation = observe_within(self.observer.as_ref(), &spec.id, spec.observe_timeout).await;
        if observation.is_missing() {
            self.stats.record_fallback();
        }
        let observation = observation.into_option();

        let plan = signal_core::plan(
            spec,
            &PlanInput {
                current_phase: state.phase_index,
                elapsed_in_phase: state.elapsed_in_phase(now_ms),
                observation: observation.as_ref(),
                now_ms,
            },
        );
        let next = state.successor(spec, &plan, now_ms);

        let swapped = {
            let signals = Arc::clone(&self.signals);
            let (key, expected, candidate) = (spec.id.clone(), state.version, next.clone());
            self.blocking(move || signals.compare_and_swap(&key, expected, &candidate))
                .await?
        };
        if !swapped {
            return Ok(self.skip(&spec.id, SkipReason::ConcurrentUpdate));
        }

        info!(
            intersection = %spec.id,
            phase = %next.phase,
            kind = ?plan.kind,
            duration_ms = next.planned_duration_ms,
            density = ?plan.density,
            version = next.version,
            "phase committed"
        );
        let outcome = EvaluationOutcome::Committed(next);
        self.stats
            .record_outcome(&outcome, plan.kind == PlanKind::Extend);
        Ok(outcome)
    }

    fn skip(&self, id: &str, reason: SkipReason) -> EvaluationOutcome {
        debug!(intersection = %id, %reason, "evaluation skipped");
        let outcome = EvaluationOutcome::Skipped(reason);
        self.stats.record_outcome(&outcome, false);
        outcome
    }

    async fn release(&self, id: &str, holder: String) {
        let leases = Arc::clone(&self.leases);
        let key = id.to_string();
        if let Err(e) = self.blocking(move || leases.release(&key, &holder)).await {
            warn!(intersection = %id, error = %e, "lease release failed, leaving it to expire");
        }
    }

    /// Run a synchronous store call on the blocking pool, bounded by the
    /// store timeout. A timed-out call keeps running in the background.
    async fn blocking<T, F>(&self, f: F) -> SchedulerResult<T>
    where
        F: FnOnce() -> StateResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => Err(SchedulerError::StoreTimeout(self.store_timeout)),
        }
    }
}
