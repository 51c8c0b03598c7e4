//! signalgrid-observer: traffic density sources for the scheduling core.
//!
//! The scheduler asks a [`TrafficObserver`] for per-approach densities and
//! always goes through [`observe_within`], which turns slow or failing
//! sources into [`Observation::Missing`] instead of an error.
//!
//! ```text
//! SyntheticFeed::run()  ──record_all()──▶  SampleObserver
//!                                            │ EMA per approach/lane
//! Scheduler ──observe_within(timeout)──▶ TrafficObserver::observe()
//! ```

pub mod feed;
pub mod observer;
pub mod sampler;

pub use feed::SyntheticFeed;
pub use observer::{
    MissingReason, NoTraffic, ObserveError, ObserveResult, Observation, TrafficObserver,
    observe_within,
};
pub use sampler::{DEFAULT_MAX_SAMPLE_AGE, SampleObserver, TrafficSample};
