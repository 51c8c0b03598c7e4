//! Phase planning: decides the next phase and how long it runs.
//!
//! Planning is a pure function of the current phase, the time spent in it,
//! the latest density observation and the intersection spec:
//!
//! ```text
//! elapsed < min(current)   → Extend(current, min(current) - elapsed)
//! otherwise                → Advance(next(current), policy.size(next))
//! ```
//!
//! `next` is always the following phase in the configured cycle, so every
//! approach is served once per cycle regardless of density. Only the duration
//! depends on traffic, through a [`DurationPolicy`]. Missing or stale
//! observations make every policy fall back to the phase's base duration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DensityObservation, IntersectionSpec, PhaseSpec, PolicyKind};

/// Inputs to a single planning decision.
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    /// Index of the phase currently showing.
    pub current_phase: usize,
    pub elapsed_in_phase: Duration,
    pub observation: Option<&'a DensityObservation>,
    /// Wall clock used to judge observation staleness.
    pub now_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// The current phase has not reached its minimum and keeps running.
    Extend,
    /// Rotate to the next phase in the cycle.
    Advance,
}

/// The planner's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub kind: PlanKind,
    pub phase_index: usize,
    pub duration: Duration,
    /// Normalized density that sized the duration, if any was usable.
    pub density: Option<f64>,
}

/// Normalized density per phase, indexed like `IntersectionSpec::phases`.
/// `None` means no usable reading for any approach the phase serves.
pub type PhaseDensities = Vec<Option<f64>>;

/// Sizes the duration of an advancing phase.
pub trait DurationPolicy: Send + Sync {
    fn size(
        &self,
        spec: &IntersectionSpec,
        phase_index: usize,
        densities: &PhaseDensities,
    ) -> Duration;
}

/// `clamp(base * (1 + weight * density), min, max)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearClamp;

impl DurationPolicy for LinearClamp {
    fn size(
        &self,
        spec: &IntersectionSpec,
        phase_index: usize,
        densities: &PhaseDensities,
    ) -> Duration {
        let phase = &spec.phases[phase_index];
        match densities.get(phase_index).copied().flatten() {
            Some(density) => {
                let scaled =
                    phase.base_duration.as_secs_f64() * (1.0 + spec.density_weight * density);
                clamp_to_phase(phase, scaled)
            }
            None => phase.base_duration,
        }
    }
}

/// Weighted round-robin: splits `cycle_time` between phases by their share
/// of the total observed density, floored at `min` and capped at `max`.
/// With zero traffic everywhere each phase gets an equal slice.
#[derive(Debug, Clone, Copy)]
pub struct ProportionalSplit {
    pub cycle_time: Duration,
}

impl DurationPolicy for ProportionalSplit {
    fn size(
        &self,
        spec: &IntersectionSpec,
        phase_index: usize,
        densities: &PhaseDensities,
    ) -> Duration {
        let phase = &spec.phases[phase_index];
        let Some(density) = densities.get(phase_index).copied().flatten() else {
            return phase.base_duration;
        };

        let total: f64 = densities.iter().flatten().sum();
        let cycle = self.cycle_time.as_secs_f64();
        let share = if total > 0.0 {
            cycle * density / total
        } else {
            cycle / spec.phases.len() as f64
        };
        clamp_to_phase(phase, share)
    }
}

/// Build the policy configured for an intersection.
pub fn policy_for(kind: &PolicyKind) -> Box<dyn DurationPolicy> {
    match kind {
        PolicyKind::Linear => Box::new(LinearClamp),
        PolicyKind::Proportional { cycle_time } => Box::new(ProportionalSplit {
            cycle_time: *cycle_time,
        }),
    }
}

/// Plan using the intersection's configured policy.
pub fn plan(spec: &IntersectionSpec, input: &PlanInput<'_>) -> PhasePlan {
    let policy = policy_for(&spec.policy);
    plan_with(policy.as_ref(), spec, input)
}

/// Plan with an explicit duration policy.
///
/// `spec.phases` must be non-empty (guaranteed by config validation). An
/// out-of-range `current_phase` wraps into the cycle.
pub fn plan_with(
    policy: &dyn DurationPolicy,
    spec: &IntersectionSpec,
    input: &PlanInput<'_>,
) -> PhasePlan {
    let current = input.current_phase % spec.phases.len();
    let min = spec.phases[current].min_duration;

    if input.elapsed_in_phase < min {
        return PhasePlan {
            kind: PlanKind::Extend,
            phase_index: current,
            duration: min - input.elapsed_in_phase,
            density: None,
        };
    }

    let densities = phase_densities(spec, input.observation, input.now_ms);
    let next = spec.next_phase_index(current);
    PhasePlan {
        kind: PlanKind::Advance,
        phase_index: next,
        duration: policy.size(spec, next, &densities),
        density: densities[next],
    }
}

/// Reduce an observation to one normalized density per phase.
///
/// A phase takes the highest density among the approaches it serves. The
/// whole observation is discarded when it belongs to another intersection or
/// is older than the staleness threshold.
pub fn phase_densities(
    spec: &IntersectionSpec,
    observation: Option<&DensityObservation>,
    now_ms: u64,
) -> PhaseDensities {
    let usable = observation.filter(|obs| {
        obs.intersection_id == spec.id && obs.age(now_ms) <= spec.staleness_threshold
    });
    let Some(obs) = usable else {
        return vec![None; spec.phases.len()];
    };

    spec.phases
        .iter()
        .map(|phase| {
            phase
                .approaches
                .iter()
                .filter_map(|a| obs.densities.get(a))
                .filter_map(|v| v.normalized(spec.saturation_count))
                .reduce(f64::max)
        })
        .collect()
}

/// Clamp a duration in seconds to the phase bounds, at millisecond precision.
fn clamp_to_phase(phase: &PhaseSpec, secs: f64) -> Duration {
    if !secs.is_finite() {
        return phase.base_duration;
    }
    let millis = (secs * 1000.0).round().max(0.0) as u64;
    Duration::from_millis(millis).clamp(phase.min_duration, phase.max_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Approach, DensityValue};

    const NOW: u64 = 1_700_000_000_000;

    fn phase(name: &str, approaches: Vec<Approach>) -> PhaseSpec {
        PhaseSpec {
            name: name.to_string(),
            approaches,
            min_duration: Duration::from_secs(10),
            max_duration: Duration::from_secs(60),
            base_duration: Duration::from_secs(30),
        }
    }

    fn abc() -> IntersectionSpec {
        IntersectionSpec {
            id: "x1".to_string(),
            name: "x1".to_string(),
            phases: vec![
                phase("A", vec![Approach::North]),
                phase("B", vec![Approach::East, Approach::West]),
                phase("C", vec![Approach::South]),
            ],
            density_weight: 1.0,
            staleness_threshold: Duration::from_secs(30),
            saturation_count: 40.0,
            lease_ttl: Duration::from_secs(10),
            evaluation_timeout: Duration::from_secs(5),
            observe_timeout: Duration::from_secs(2),
            policy: PolicyKind::Linear,
        }
    }

    fn input(current: usize, elapsed_secs: u64, obs: Option<&DensityObservation>) -> PlanInput<'_> {
        PlanInput {
            current_phase: current,
            elapsed_in_phase: Duration::from_secs(elapsed_secs),
            observation: obs,
            now_ms: NOW,
        }
    }

    #[test]
    fn advances_with_density_scaled_duration() {
        let spec = abc();
        let obs = DensityObservation::new("x1", NOW - 1_000)
            .with(Approach::East, DensityValue::Ratio(0.8));

        let plan = plan(&spec, &input(0, 35, Some(&obs)));
        assert_eq!(plan.kind, PlanKind::Advance);
        assert_eq!(plan.phase_index, 1);
        assert_eq!(plan.duration, Duration::from_secs(54));
        assert_eq!(plan.density, Some(0.8));
    }

    #[test]
    fn extends_phase_below_minimum() {
        let spec = abc();
        let plan = plan(&spec, &input(0, 5, None));
        assert_eq!(plan.kind, PlanKind::Extend);
        assert_eq!(plan.phase_index, 0);
        assert_eq!(plan.duration, Duration::from_secs(5));
    }

    #[test]
    fn minimum_boundary_advances() {
        let spec = abc();
        let plan = plan(&spec, &input(0, 10, None));
        assert_eq!(plan.kind, PlanKind::Advance);
        assert_eq!(plan.phase_index, 1);
    }

    #[test]
    fn wraps_after_last_phase() {
        let spec = abc();
        let plan = plan(&spec, &input(2, 40, None));
        assert_eq!(plan.phase_index, 0);
    }

    #[test]
    fn missing_observation_uses_base() {
        let spec = abc();
        let plan = plan(&spec, &input(1, 40, None));
        assert_eq!(plan.duration, Duration::from_secs(30));
        assert_eq!(plan.density, None);
    }

    #[test]
    fn stale_observation_uses_base() {
        let spec = abc();
        let obs = DensityObservation::new("x1", NOW - 31_000)
            .with(Approach::East, DensityValue::Ratio(1.0));
        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(30));
    }

    #[test]
    fn observation_for_other_intersection_is_ignored() {
        let spec = abc();
        let obs = DensityObservation::new("x2", NOW)
            .with(Approach::East, DensityValue::Ratio(1.0));
        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(30));
    }

    #[test]
    fn unserved_approach_counts_as_missing() {
        let spec = abc();
        // Only North reported; B serves East/West.
        let obs = DensityObservation::new("x1", NOW)
            .with(Approach::North, DensityValue::Ratio(1.0));
        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(30));
    }

    #[test]
    fn phase_takes_busiest_approach() {
        let spec = abc();
        let obs = DensityObservation::new("x1", NOW)
            .with(Approach::East, DensityValue::Count(8.0))
            .with(Approach::West, DensityValue::Count(20.0));
        let densities = phase_densities(&spec, Some(&obs), NOW);
        assert_eq!(densities, vec![None, Some(0.5), None]);
    }

    #[test]
    fn linear_duration_respects_bounds() {
        let mut spec = abc();
        spec.density_weight = 10.0;
        let obs = DensityObservation::new("x1", NOW)
            .with(Approach::East, DensityValue::Ratio(1.0));
        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(60));

        spec.phases[1].base_duration = Duration::from_secs(10);
        spec.density_weight = 0.0;
        let plan = super::plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(10));
    }

    #[test]
    fn full_cycle_visits_every_phase_in_order() {
        let spec = abc();
        let mut current = 0;
        let mut visited = Vec::new();
        for _ in 0..6 {
            let plan = plan(&spec, &input(current, 60, None));
            current = plan.phase_index;
            visited.push(spec.phases[current].name.clone());
        }
        assert_eq!(visited, ["B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn proportional_split_shares_cycle() {
        let mut spec = abc();
        spec.policy = PolicyKind::Proportional {
            cycle_time: Duration::from_secs(90),
        };
        let obs = DensityObservation::new("x1", NOW)
            .with(Approach::North, DensityValue::Ratio(0.2))
            .with(Approach::East, DensityValue::Ratio(0.6))
            .with(Approach::South, DensityValue::Ratio(0.2));

        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(54));

        // A's share is 18s, already above its 10s floor.
        let plan = super::plan(&spec, &input(2, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(18));
    }

    #[test]
    fn proportional_split_with_no_traffic_is_equal() {
        let mut spec = abc();
        spec.policy = PolicyKind::Proportional {
            cycle_time: Duration::from_secs(60),
        };
        let obs = DensityObservation::new("x1", NOW)
            .with(Approach::North, DensityValue::Count(0.0))
            .with(Approach::East, DensityValue::Count(0.0))
            .with(Approach::South, DensityValue::Count(0.0));
        let plan = plan(&spec, &input(0, 40, Some(&obs)));
        assert_eq!(plan.duration, Duration::from_secs(20));
    }

    #[test]
    fn out_of_range_phase_wraps() {
        let spec = abc();
        let plan = plan(&spec, &input(4, 40, None));
        // 4 % 3 == 1 → next is C.
        assert_eq!(plan.phase_index, 2);
    }
}
