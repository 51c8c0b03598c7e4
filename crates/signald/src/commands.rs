//! Subcommand implementations.
//!
//! Everything here returns `anyhow::Result` with context attached; `main`
//! only parses arguments and prints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{error, info, warn};

use signal_core::{SignalConfig, ValidatedConfig, epoch_millis};
use signalgrid_observer::{
    DEFAULT_MAX_SAMPLE_AGE, NoTraffic, SampleObserver, SyntheticFeed, TrafficObserver,
};
use signalgrid_scheduler::{DispatchReport, DispatchResult, Dispatcher, Scheduler};
use signalgrid_state::{SignalStore, StateStore};

/// Database file inside the data directory.
pub const DB_FILE: &str = "signalgrid.redb";

pub fn load_config(path: &Path) -> anyhow::Result<ValidatedConfig> {
    let config = SignalConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)
        .with_context(|| format!("failed to open state store at {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// Write a starter config to `path`.
pub fn init_config(path: &Path, id: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let rendered = SignalConfig::scaffold(id).to_toml_string()?;
    std::fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), intersection = %id, "config scaffolded");
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub provisioned: usize,
    pub removed: Vec<String>,
}

/// Make the store match the config: provision every configured
/// intersection and drop the ones no longer configured.
pub fn provision_all(
    store: &StateStore,
    config: &ValidatedConfig,
    now_ms: u64,
) -> anyhow::Result<ProvisionSummary> {
    let mut summary = ProvisionSummary::default();

    for spec in &config.intersections {
        store
            .provision(spec, now_ms)
            .with_context(|| format!("failed to provision {}", spec.id))?;
        summary.provisioned += 1;
    }

    for id in store.intersection_ids()? {
        if config.intersections.iter().any(|s| s.id == id) {
            continue;
        }
        store.remove_intersection(&id)?;
        warn!(intersection = %id, "removed intersection missing from config");
        summary.removed.push(id);
    }

    Ok(summary)
}

/// Stored signal states with their time to the next evaluation, plus any
/// live lease.
pub fn status_report(store: &StateStore, id: Option<&str>, now_ms: u64) -> anyhow::Result<Value> {
    let mut signals = store.list_signals()?;
    if let Some(id) = id {
        signals.retain(|s| s.intersection_id == id);
        if signals.is_empty() {
            bail!("intersection {id} is not provisioned");
        }
    }
    signals.sort_by(|a, b| a.intersection_id.cmp(&b.intersection_id));

    let mut entries = Vec::with_capacity(signals.len());
    for state in signals {
        let lease = store
            .get_lease(&state.intersection_id)?
            .filter(|l| l.is_live(now_ms));
        entries.push(json!({
            "due_in_ms": state.due_at_ms().saturating_sub(now_ms),
            "lease": lease,
            "state": state,
        }));
    }
    Ok(Value::Array(entries))
}

/// Build the observer the daemon settings ask for. With the synthetic feed
/// enabled the returned feed must be driven by the caller.
fn build_observer(
    store: &StateStore,
    config: &ValidatedConfig,
) -> (Arc<dyn TrafficObserver>, Option<SyntheticFeed>) {
    if config.daemon.synthetic_feed {
        let max_age = config
            .intersections
            .iter()
            .map(|spec| spec.staleness_threshold)
            .min()
            .unwrap_or(DEFAULT_MAX_SAMPLE_AGE);
        let sampler = SampleObserver::new().with_max_age(max_age);
        let feed = SyntheticFeed::new(Arc::new(store.clone()), sampler.clone());
        (Arc::new(sampler), Some(feed))
    } else {
        (Arc::new(NoTraffic), None)
    }
}

/// One evaluation pass, for a single intersection or all of them.
pub async fn evaluate_once(
    store: &StateStore,
    config: &ValidatedConfig,
    id: Option<&str>,
) -> anyhow::Result<Vec<DispatchReport>> {
    let (observer, feed) = build_observer(store, config);
    if let Some(feed) = &feed {
        feed.generate_once().await?;
    }
    let scheduler = Arc::new(Scheduler::with_store(
        store.clone(),
        observer,
        config.daemon.store_timeout,
    ));

    match id {
        Some(id) => {
            let result = match scheduler.evaluate(id).await {
                Ok(outcome) => DispatchResult::Completed(outcome),
                Err(e) => DispatchResult::Failed(e.to_string()),
            };
            Ok(vec![DispatchReport {
                intersection_id: id.to_string(),
                result,
            }])
        }
        None => {
            let dispatcher = Dispatcher::new(scheduler, config.daemon.max_concurrency);
            Ok(dispatcher.trigger_all().await?)
        }
    }
}

/// Run the dispatcher (and synthetic feed, if enabled) until Ctrl-C.
pub async fn run(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("SignalGrid daemon starting");

    let config = load_config(&config_path)?;
    let store = open_store(&data_dir)?;
    let summary = provision_all(&store, &config, epoch_millis())?;
    info!(
        intersections = summary.provisioned,
        removed = summary.removed.len(),
        "provisioning complete"
    );

    let (observer, feed) = build_observer(&store, &config);
    let scheduler = Arc::new(Scheduler::with_store(
        store.clone(),
        observer,
        config.daemon.store_timeout,
    ));
    let dispatcher = Dispatcher::new(Arc::clone(&scheduler), config.daemon.max_concurrency);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let feed_handle = feed.map(|feed| {
        let shutdown = shutdown_rx.clone();
        let interval = config.daemon.feed_interval;
        tokio::spawn(async move {
            if let Err(e) = feed.generate_once().await {
                warn!(error = %e, "initial synthetic round failed");
            }
            feed.run(interval, shutdown).await;
        })
    });

    let tick = config.daemon.tick;
    let dispatch_handle = tokio::spawn(async move {
        dispatcher.run(tick, shutdown_rx).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = dispatch_handle.await;
    if let Some(handle) = feed_handle {
        let _ = handle.await;
    }

    let stats = scheduler.stats().snapshot();
    info!(
        advanced = stats.advanced,
        extended = stats.extended,
        skipped = stats.skipped(),
        observer_fallbacks = stats.observer_fallbacks,
        failures = stats.failures,
        "SignalGrid daemon stopped"
    );
    Ok(())
}
