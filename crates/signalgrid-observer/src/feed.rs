//! Synthetic traffic generator for demos and soak runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tracing::{debug, info, warn};

use signal_core::{Approach, IntersectionId, Lane, epoch_millis};
use signalgrid_state::SignalStore;

use crate::sampler::{SampleObserver, TrafficSample};

/// Inclusive bounds of a generated vehicle count.
pub const MIN_VEHICLES: u32 = 5;
pub const MAX_VEHICLES: u32 = 40;

/// Records a random count for every approach and lane of every provisioned
/// intersection into a [`SampleObserver`].
pub struct SyntheticFeed {
    store: Arc<dyn SignalStore>,
    sampler: SampleObserver,
}

impl SyntheticFeed {
    pub fn new(store: Arc<dyn SignalStore>, sampler: SampleObserver) -> Self {
        Self { store, sampler }
    }

    /// Generate one round of samples. Returns how many were recorded.
    pub async fn generate_once(&self) -> anyhow::Result<usize> {
        let store = Arc::clone(&self.store);
        let ids = tokio::task::spawn_blocking(move || store.intersection_ids())
            .await
            .context("intersection listing task failed")?
            .context("failed to list intersections")?;

        let samples = synthesize(&ids, epoch_millis());
        let count = samples.len();
        self.sampler.record_all(samples).await;
        debug!(intersections = ids.len(), samples = count, "synthetic traffic recorded");
        Ok(count)
    }

    /// Generate samples every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "synthetic feed started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.generate_once().await {
                        warn!(error = %e, "synthetic feed round failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("synthetic feed shutting down");
                    break;
                }
            }
        }
    }
}

fn synthesize(ids: &[IntersectionId], now_ms: u64) -> Vec<TrafficSample> {
    let mut rng = rand::thread_rng();
    let mut samples = Vec::with_capacity(ids.len() * Approach::ALL.len() * Lane::ALL.len());
    for id in ids {
        for approach in Approach::ALL {
            for lane in Lane::ALL {
                samples.push(TrafficSample {
                    intersection_id: id.clone(),
                    approach,
                    lane,
                    vehicle_count: rng.gen_range(MIN_VEHICLES..=MAX_VEHICLES),
                    observed_at_ms: now_ms,
                });
            }
        }
    }
    samples
}
