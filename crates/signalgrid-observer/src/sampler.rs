//! Count-based observer fed by raw per-lane vehicle samples.
//!
//! Each approach/lane keeps a short history of counts. A prediction
//! smooths that history with an exponential moving average and folds the
//! lanes of an approach into one weighted count.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use signal_core::{
    Approach, DensityObservation, DensityValue, IntersectionId, Lane, epoch_millis,
};

use crate::observer::{ObserveError, ObserveResult, TrafficObserver};

/// Smoothing factor applied to each newer sample.
pub const EMA_ALPHA: f64 = 0.3;

/// Samples retained per approach/lane.
pub const HISTORY_LEN: usize = 10;

/// Approaches whose newest sample is older than this are left out of a
/// prediction.
pub const DEFAULT_MAX_SAMPLE_AGE: Duration = Duration::from_secs(30);

/// One raw vehicle count.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficSample {
    pub intersection_id: IntersectionId,
    pub approach: Approach,
    pub lane: Lane,
    pub vehicle_count: u32,
    pub observed_at_ms: u64,
}

#[derive(Debug, Default)]
struct LaneHistory {
    counts: VecDeque<u32>,
    last_at_ms: u64,
}

impl LaneHistory {
    fn push(&mut self, count: u32, at_ms: u64) {
        if self.counts.len() == HISTORY_LEN {
            self.counts.pop_front();
        }
        self.counts.push_back(count);
        self.last_at_ms = self.last_at_ms.max(at_ms);
    }
}

type SampleKey = (IntersectionId, Approach, Lane);

/// In-memory [`TrafficObserver`] over recorded samples.
///
/// Cheap to clone; clones share the same sample history.
#[derive(Debug, Clone)]
pub struct SampleObserver {
    samples: Arc<RwLock<HashMap<SampleKey, LaneHistory>>>,
    max_age: Duration,
}

impl Default for SampleObserver {
    fn default() -> Self {
        Self {
            samples: Arc::default(),
            max_age: DEFAULT_MAX_SAMPLE_AGE,
        }
    }
}

impl SampleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how old an approach's newest sample may be and still count.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub async fn record(&self, sample: TrafficSample) {
        self.record_all(std::iter::once(sample)).await;
    }

    /// Record a batch under one write lock.
    pub async fn record_all(&self, samples: impl IntoIterator<Item = TrafficSample>) {
        let mut map = self.samples.write().await;
        for s in samples {
            map.entry((s.intersection_id, s.approach, s.lane))
                .or_default()
                .push(s.vehicle_count, s.observed_at_ms);
        }
    }

    /// [`predict_at`](Self::predict_at) against the wall clock.
    pub async fn predict(&self, intersection_id: &str) -> Option<DensityObservation> {
        self.predict_at(intersection_id, epoch_millis()).await
    }

    /// Smoothed, lane-weighted counts per approach as of `now_ms`.
    ///
    /// Approaches without samples, or whose newest sample is older than the
    /// max age, are left out. The observation is stamped with the oldest of
    /// the included approaches' newest samples, so its age covers every
    /// density it carries. `None` if no approach qualifies.
    pub async fn predict_at(
        &self,
        intersection_id: &str,
        now_ms: u64,
    ) -> Option<DensityObservation> {
        let map = self.samples.read().await;
        let max_age_ms = u64::try_from(self.max_age.as_millis()).unwrap_or(u64::MAX);
        let mut densities = BTreeMap::new();
        let mut stamp: Option<u64> = None;

        for approach in Approach::ALL {
            let mut weighted = 0.0;
            let mut newest: Option<u64> = None;
            for lane in Lane::ALL {
                let key = (intersection_id.to_string(), approach, lane);
                let Some(history) = map.get(&key) else {
                    continue;
                };
                if let Some(ema) = ema(&history.counts) {
                    weighted += lane.weight() * ema;
                    newest = Some(newest.map_or(history.last_at_ms, |n| n.max(history.last_at_ms)));
                }
            }
            let Some(newest) = newest else {
                continue;
            };
            if now_ms.saturating_sub(newest) > max_age_ms {
                trace!(intersection = %intersection_id, ?approach, "approach samples stale");
                continue;
            }
            densities.insert(approach, DensityValue::Count(round2(weighted)));
            stamp = Some(stamp.map_or(newest, |s| s.min(newest)));
        }

        let observed_at_ms = stamp?;
        trace!(intersection = %intersection_id, approaches = densities.len(), "predicted densities");
        Some(DensityObservation {
            intersection_id: intersection_id.to_string(),
            observed_at_ms,
            densities,
        })
    }
}

#[async_trait]
impl TrafficObserver for SampleObserver {
    async fn observe(&self, intersection_id: &str) -> ObserveResult<DensityObservation> {
        self.predict(intersection_id)
            .await
            .ok_or_else(|| ObserveError::NoData(intersection_id.to_string()))
    }
}

/// EMA seeded with the oldest value, oldest to newest.
fn ema(counts: &VecDeque<u32>) -> Option<f64> {
    let mut iter = counts.iter();
    let first = f64::from(*iter.next()?);
    Some(iter.fold(first, |acc, &v| EMA_ALPHA * f64::from(v) + (1.0 - EMA_ALPHA) * acc))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
