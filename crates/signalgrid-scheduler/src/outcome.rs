//! Result of a single evaluation attempt.

use serde::{Deserialize, Serialize};

use signalgrid_state::SignalState;

/// Why an evaluation ended without committing. All of these are normal
/// under overlapping or repeated triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another evaluation holds the lease.
    AlreadyInProgress,
    /// The current planned duration has not run out.
    NotDue,
    /// Another writer committed after this evaluation read the state.
    ConcurrentUpdate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyInProgress => "already_in_progress",
            SkipReason::NotDue => "not_due",
            SkipReason::ConcurrentUpdate => "concurrent_update",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Committed(SignalState),
    Skipped(SkipReason),
}

impl EvaluationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, EvaluationOutcome::Committed(_))
    }

    pub fn committed(&self) -> Option<&SignalState> {
        match self {
            EvaluationOutcome::Committed(state) => Some(state),
            EvaluationOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            EvaluationOutcome::Committed(_) => None,
            EvaluationOutcome::Skipped(reason) => Some(*reason),
        }
    }
}
