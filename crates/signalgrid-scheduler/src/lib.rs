//! signalgrid-scheduler: the adaptive signal scheduling core.
//!
//! [`Scheduler::evaluate`] is the per-intersection entry point. It is safe
//! to call from overlapping or redelivered triggers: a lease keeps at most
//! one evaluation of an intersection in flight, and every commit is a
//! compare-and-swap on the state version.
//!
//! ```text
//! Dispatcher::run(tick)
//!   └── trigger_all()
//!         ├── purge expired leases
//!         └── per intersection (bounded by a semaphore)
//!               └── Scheduler::evaluate(id)
//!                     ├── LeaseStore::try_acquire     → Skipped(AlreadyInProgress)
//!                     ├── SignalStore::read           → Skipped(NotDue)
//!                     ├── observe_within + plan
//!                     ├── SignalStore::compare_and_swap → Skipped(ConcurrentUpdate)
//!                     └── LeaseStore::release         → Committed(state)
//! ```

pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod scheduler;
pub mod stats;

pub use dispatcher::{DispatchReport, DispatchResult, Dispatcher, PassSummary};
pub use error::{SchedulerError, SchedulerResult};
pub use outcome::{EvaluationOutcome, SkipReason};
pub use scheduler::{DEFAULT_STORE_TIMEOUT, Scheduler};
pub use stats::{EvaluationStats, StatsSnapshot};
