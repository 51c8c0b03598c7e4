//! Persisted signal state and evaluation leases.
//!
//! Both types are JSON-serialized into redb tables keyed by intersection id.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use signal_core::{IntersectionId, IntersectionSpec, PhasePlan, PlanKind};

// ── Signal state ──────────────────────────────────────────────────

/// What an intersection is currently showing and until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalState {
    pub intersection_id: IntersectionId,
    /// Index into the intersection's phase list.
    pub phase_index: usize,
    /// Name of the phase at `phase_index` when this state was written.
    pub phase: String,
    /// Unix timestamp (ms) the current phase was entered.
    pub phase_started_at_ms: u64,
    /// Unix timestamp (ms) the current planned duration was committed.
    /// Equal to `phase_started_at_ms` unless the phase was extended.
    pub planned_at_ms: u64,
    pub planned_duration_ms: u64,
    /// Bumped by exactly one on every committed update.
    pub version: u64,
}

impl SignalState {
    /// State written at provisioning: first phase, base duration, version 1.
    /// `spec.phases` must be non-empty.
    pub fn initial(spec: &IntersectionSpec, now_ms: u64) -> Self {
        let first = &spec.phases[0];
        Self {
            intersection_id: spec.id.clone(),
            phase_index: 0,
            phase: first.name.clone(),
            phase_started_at_ms: now_ms,
            planned_at_ms: now_ms,
            planned_duration_ms: first.base_duration.as_millis() as u64,
            version: 1,
        }
    }

    /// When the current planned duration runs out.
    pub fn due_at_ms(&self) -> u64 {
        self.planned_at_ms.saturating_add(self.planned_duration_ms)
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.due_at_ms()
    }

    pub fn elapsed_in_phase(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.phase_started_at_ms))
    }

    pub fn planned_duration(&self) -> Duration {
        Duration::from_millis(self.planned_duration_ms)
    }

    /// The state that results from committing `plan` at `now_ms`.
    ///
    /// Timestamps never move backwards, even if `now_ms` lags the clock of
    /// whoever wrote the current state.
    pub fn successor(&self, spec: &IntersectionSpec, plan: &PhasePlan, now_ms: u64) -> Self {
        let planned_at_ms = now_ms.max(self.planned_at_ms);
        let phase_started_at_ms = match plan.kind {
            PlanKind::Advance => planned_at_ms.max(self.phase_started_at_ms),
            PlanKind::Extend => self.phase_started_at_ms,
        };
        Self {
            intersection_id: self.intersection_id.clone(),
            phase_index: plan.phase_index,
            phase: spec
                .phase(plan.phase_index)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            phase_started_at_ms,
            planned_at_ms,
            planned_duration_ms: plan.duration.as_millis() as u64,
            version: self.version + 1,
        }
    }

    /// Whether this state still points at a phase that exists in `spec`.
    pub fn matches(&self, spec: &IntersectionSpec) -> bool {
        spec.phase(self.phase_index)
            .is_some_and(|p| p.name == self.phase)
    }
}

// ── Lease ─────────────────────────────────────────────────────────

/// A time-bounded exclusive claim on evaluating one intersection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationLease {
    pub intersection_id: IntersectionId,
    /// Opaque token identifying the evaluation attempt.
    pub holder: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl EvaluationLease {
    pub fn new(intersection_id: &str, holder: &str, ttl: Duration, now_ms: u64) -> Self {
        Self {
            intersection_id: intersection_id.to_string(),
            holder: holder.to_string(),
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl.as_millis() as u64),
        }
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}
