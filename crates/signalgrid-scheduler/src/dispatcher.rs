//! Periodic fan-out of evaluations across all intersections.
//!
//! The dispatcher is the in-process trigger source. Each tick it sweeps
//! expired leases (best effort), then starts one evaluation per provisioned intersection
//! on its own task, bounded by a concurrency limit. It waits for each run
//! up to that intersection's evaluation timeout. A run that overstays is
//! reported as timed out but keeps going; its lease stops the next tick
//! from evaluating the same intersection twice.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use signal_core::{IntersectionId, epoch_millis};

use crate::error::SchedulerResult;
use crate::outcome::EvaluationOutcome;
use crate::scheduler::Scheduler;

/// How one intersection's evaluation ended from the dispatcher's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum DispatchResult {
    Completed(EvaluationOutcome),
    Failed(String),
    /// Still running when the wait ran out; not cancelled.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub intersection_id: IntersectionId,
    pub result: DispatchResult,
}

/// Tally of one dispatch pass, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl PassSummary {
    pub fn from_reports(reports: &[DispatchReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            match &report.result {
                DispatchResult::Completed(o) if o.is_committed() => summary.committed += 1,
                DispatchResult::Completed(_) => summary.skipped += 1,
                DispatchResult::Failed(_) => summary.failed += 1,
                DispatchResult::TimedOut => summary.timed_out += 1,
            }
        }
        summary
    }
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<Scheduler>, max_concurrency: usize) -> Self {
        Self {
            scheduler,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run one pass over every provisioned intersection.
    ///
    /// A failed lease sweep is only logged: expired leases never block
    /// acquisition, so the pass goes ahead.
    pub async fn trigger_all(&self) -> SchedulerResult<Vec<DispatchReport>> {
        match self.scheduler.purge_expired_leases(epoch_millis()).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired leases swept"),
            Err(e) => warn!(error = %e, "lease sweep failed, leases will expire on their own"),
        }

        let specs = self.scheduler.intersections().await?;
        let started = Instant::now();
        let mut pending = Vec::with_capacity(specs.len());

        for spec in specs {
            let scheduler = Arc::clone(&self.scheduler);
            let permits = Arc::clone(&self.permits);
            let id = spec.id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                scheduler.evaluate(&id).await
            });
            pending.push((spec.id, started + spec.evaluation_timeout, handle));
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (intersection_id, deadline, mut handle) in pending {
            let result = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(outcome))) => DispatchResult::Completed(outcome),
                Ok(Ok(Err(e))) => DispatchResult::Failed(e.to_string()),
                Ok(Err(join)) => DispatchResult::Failed(format!("evaluation task failed: {join}")),
                Err(_) => {
                    // Dropping the handle detaches the task.
                    warn!(intersection = %intersection_id, "evaluation still running past its timeout");
                    DispatchResult::TimedOut
                }
            };
            reports.push(DispatchReport {
                intersection_id,
                result,
            });
        }
        Ok(reports)
    }

    /// Dispatch every `tick` until `shutdown` fires.
    pub async fn run(&self, tick: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(tick_ms = tick.as_millis() as u64, "dispatcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    match self.trigger_all().await {
                        Ok(reports) => {
                            let summary = PassSummary::from_reports(&reports);
                            debug!(
                                intersections = reports.len(),
                                committed = summary.committed,
                                skipped = summary.skipped,
                                failed = summary.failed,
                                timed_out = summary.timed_out,
                                "dispatch pass complete"
                            );
                        }
                        Err(e) => error!(error = %e, "dispatch pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use signal_core::{
        Approach, DensityObservation, IntersectionSpec, PhaseSpec, PolicyKind,
    };
    use signalgrid_observer::{NoTraffic, ObserveResult, TrafficObserver};
    use signalgrid_state::{
        LeaseStore, SignalState, SignalStore, StateError, StateResult, StateStore,
    };

    use crate::outcome::SkipReason;
    use crate::scheduler::DEFAULT_STORE_TIMEOUT;

    struct Stalled;

    #[async_trait]
    impl TrafficObserver for Stalled {
        async fn observe(&self, id: &str) -> ObserveResult<DensityObservation> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(DensityObservation::new(id, epoch_millis()))
        }
    }

    /// Leases work but the expiry sweep always fails.
    struct SweepFails(StateStore);

    impl LeaseStore for SweepFails {
        fn try_acquire(
            &self,
            id: &str,
            holder: &str,
            ttl: Duration,
            now_ms: u64,
        ) -> StateResult<bool> {
            self.0.try_acquire(id, holder, ttl, now_ms)
        }

        fn release(&self, id: &str, holder: &str) -> StateResult<()> {
            LeaseStore::release(&self.0, id, holder)
        }

        fn purge_expired(&self, _: u64) -> StateResult<u32> {
            Err(StateError::Deserialize("corrupt lease record".into()))
        }
    }

    /// One intersection's config is unreadable.
    struct CorruptConfig {
        store: StateStore,
        bad: &'static str,
    }

    impl SignalStore for CorruptConfig {
        fn intersection(&self, id: &str) -> StateResult<Option<IntersectionSpec>> {
            if id == self.bad {
                return Err(StateError::Deserialize(format!("bad config for {id}")));
            }
            self.store.intersection(id)
        }

        fn intersection_ids(&self) -> StateResult<Vec<IntersectionId>> {
            SignalStore::intersection_ids(&self.store)
        }

        fn read(&self, id: &str) -> StateResult<Option<SignalState>> {
            self.store.read(id)
        }

        fn compare_and_swap(&self, id: &str, v: u64, s: &SignalState) -> StateResult<bool> {
            self.store.compare_and_swap(id, v, s)
        }
    }

    fn spec(id: &str, eval_timeout: Duration, observe_timeout: Duration) -> IntersectionSpec {
        let phase = |name: &str| PhaseSpec {
            name: name.to_string(),
            approaches: vec![Approach::North],
            min_duration: Duration::from_millis(10),
            max_duration: Duration::from_secs(60),
            base_duration: Duration::from_millis(20),
        };
        IntersectionSpec {
            id: id.to_string(),
            name: id.to_string(),
            phases: vec![phase("A"), phase("B")],
            density_weight: 1.0,
            staleness_threshold: Duration::from_secs(30),
            saturation_count: 40.0,
            lease_ttl: Duration::from_secs(10),
            evaluation_timeout: eval_timeout,
            observe_timeout,
            policy: PolicyKind::Linear,
        }
    }

    fn dispatcher(store: &StateStore, observer: Arc<dyn TrafficObserver>) -> Dispatcher {
        let scheduler = Scheduler::with_store(store.clone(), observer, DEFAULT_STORE_TIMEOUT);
        Dispatcher::new(Arc::new(scheduler), 4)
    }

    #[tokio::test]
    async fn empty_store_dispatches_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let reports = dispatcher(&store, Arc::new(NoTraffic)).trigger_all().await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn every_intersection_gets_one_report() {
        let store = StateStore::open_in_memory().unwrap();
        let long = Duration::from_secs(5);
        // Provisioned in the past so the first phase is already due.
        let past = epoch_millis() - 60_000;
        for id in ["a", "b", "c"] {
            store.provision(&spec(id, long, long), past).unwrap();
        }

        let reports = dispatcher(&store, Arc::new(NoTraffic)).trigger_all().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(PassSummary::from_reports(&reports).committed, 3);
        for id in ["a", "b", "c"] {
            assert_eq!(store.get_signal(id).unwrap().unwrap().phase, "B");
        }
    }

    #[tokio::test]
    async fn failed_lease_sweep_does_not_stop_the_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let long = Duration::from_secs(5);
        let past = epoch_millis() - 60_000;
        for id in ["a", "b", "c"] {
            store.provision(&spec(id, long, long), past).unwrap();
        }

        let scheduler = Scheduler::new(
            Arc::new(store.clone()),
            Arc::new(SweepFails(store.clone())),
            Arc::new(NoTraffic),
            DEFAULT_STORE_TIMEOUT,
        );
        let d = Dispatcher::new(Arc::new(scheduler), 4);

        let reports = d.trigger_all().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(PassSummary::from_reports(&reports).committed, 3);
    }

    #[tokio::test]
    async fn unreadable_config_skips_only_that_intersection() {
        let store = StateStore::open_in_memory().unwrap();
        let long = Duration::from_secs(5);
        let past = epoch_millis() - 60_000;
        for id in ["a", "bad", "c"] {
            store.provision(&spec(id, long, long), past).unwrap();
        }

        let scheduler = Scheduler::new(
            Arc::new(CorruptConfig {
                store: store.clone(),
                bad: "bad",
            }),
            Arc::new(store.clone()),
            Arc::new(NoTraffic),
            DEFAULT_STORE_TIMEOUT,
        );
        let d = Dispatcher::new(Arc::new(scheduler), 4);

        let reports = d.trigger_all().await.unwrap();
        let mut ids: Vec<_> = reports.iter().map(|r| r.intersection_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(PassSummary::from_reports(&reports).committed, 2);
        assert_eq!(store.get_signal("bad").unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn overrunning_evaluation_is_reported_not_cancelled() {
        let store = StateStore::open_in_memory().unwrap();
        let past = epoch_millis() - 60_000;
        store
            .provision(
                &spec("slow", Duration::from_millis(50), Duration::from_secs(2)),
                past,
            )
            .unwrap();

        let d = dispatcher(&store, Arc::new(Stalled));
        let reports = d.trigger_all().await.unwrap();
        assert_eq!(reports[0].result, DispatchResult::TimedOut);

        // The detached run still holds the lease.
        let again = d.scheduler().evaluate("slow").await.unwrap();
        assert_eq!(again, EvaluationOutcome::Skipped(SkipReason::AlreadyInProgress));

        // And still commits on its own.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let state = store.get_signal("slow").unwrap().unwrap();
        assert_eq!((state.phase.as_str(), state.version), ("B", 2));
    }

    #[tokio::test]
    async fn run_loop_commits_and_stops() {
        let store = StateStore::open_in_memory().unwrap();
        let past = epoch_millis() - 60_000;
        let long = Duration::from_secs(5);
        store.provision(&spec("x1", long, long), past).unwrap();

        let d = Arc::new(dispatcher(&store, Arc::new(NoTraffic)));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let runner = Arc::clone(&d);
        let handle = tokio::spawn(async move { runner.run(Duration::from_millis(10), rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(d.scheduler().stats().snapshot().committed() >= 1);
        assert!(store.get_signal("x1").unwrap().unwrap().version >= 2);
    }
}
