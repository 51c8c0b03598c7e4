//! Scheduler error types.
//!
//! Benign skips are not errors; they are reported through
//! [`EvaluationOutcome`](crate::EvaluationOutcome). Everything here is an
//! infrastructure or provisioning failure.

use std::time::Duration;

use thiserror::Error;

/// Errors that can abort an evaluation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("intersection not found: {0}")]
    IntersectionNotFound(String),

    #[error("intersection {0} has no signal state")]
    NotProvisioned(String),

    #[error("state store error: {0}")]
    State(#[from] signalgrid_state::StateError),

    #[error("state store did not respond within {0:?}")]
    StoreTimeout(Duration),

    #[error("state store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
