//! The traffic observer contract and its timeout wrapper.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use signal_core::DensityObservation;

/// Errors a traffic source can report.
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("no traffic data for {0}")]
    NoData(String),

    #[error("traffic source failed: {0}")]
    Source(String),
}

pub type ObserveResult<T> = Result<T, ObserveError>;

/// A source of per-approach traffic density for an intersection.
///
/// Implementations may be slow or fail; callers go through
/// [`observe_within`] so a misbehaving source never holds up planning.
#[async_trait]
pub trait TrafficObserver: Send + Sync {
    async fn observe(&self, intersection_id: &str) -> ObserveResult<DensityObservation>;
}

/// Why no observation was available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingReason {
    TimedOut(Duration),
    NoData,
    Failed(String),
}

/// Outcome of a bounded observation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Observed(DensityObservation),
    Missing(MissingReason),
}

impl Observation {
    pub fn into_option(self) -> Option<DensityObservation> {
        match self {
            Observation::Observed(obs) => Some(obs),
            Observation::Missing(_) => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Observation::Missing(_))
    }
}

/// Ask `observer` for densities, giving up after `timeout`.
///
/// Timeouts and errors become [`Observation::Missing`]; they are logged
/// here and never propagated.
pub async fn observe_within(
    observer: &dyn TrafficObserver,
    intersection_id: &str,
    timeout: Duration,
) -> Observation {
    match tokio::time::timeout(timeout, observer.observe(intersection_id)).await {
        Ok(Ok(obs)) => Observation::Observed(obs),
        Ok(Err(ObserveError::NoData(_))) => {
            warn!(intersection = %intersection_id, "no traffic data, using base durations");
            Observation::Missing(MissingReason::NoData)
        }
        Ok(Err(e)) => {
            warn!(intersection = %intersection_id, error = %e, "traffic observer failed");
            Observation::Missing(MissingReason::Failed(e.to_string()))
        }
        Err(_) => {
            warn!(
                intersection = %intersection_id,
                timeout_ms = timeout.as_millis() as u64,
                "traffic observer timed out"
            );
            Observation::Missing(MissingReason::TimedOut(timeout))
        }
    }
}

/// An observer that never has data. Every evaluation falls back to base
/// durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTraffic;

#[async_trait]
impl TrafficObserver for NoTraffic {
    async fn observe(&self, intersection_id: &str) -> ObserveResult<DensityObservation> {
        Err(ObserveError::NoData(intersection_id.to_string()))
    }
}
