//! Shared types used across SignalGrid crates.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Stable identifier of an intersection.
pub type IntersectionId = String;

/// An approach into an intersection, named by the compass direction traffic
/// arrives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Approach {
    #[serde(rename = "N")]
    North,
    #[serde(rename = "E")]
    East,
    #[serde(rename = "S")]
    South,
    #[serde(rename = "W")]
    West,
}

impl Approach {
    pub const ALL: [Approach; 4] = [
        Approach::North,
        Approach::East,
        Approach::South,
        Approach::West,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Approach::North => "N",
            Approach::East => "E",
            Approach::South => "S",
            Approach::West => "W",
        }
    }
}

/// Lane group within an approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Straight,
    Left,
    Right,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Straight, Lane::Left, Lane::Right];

    /// Share of an approach's volume attributed to this lane group.
    pub fn weight(&self) -> f64 {
        match self {
            Lane::Straight => 0.6,
            Lane::Left => 0.2,
            Lane::Right => 0.2,
        }
    }
}

/// A density reading for one approach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DensityValue {
    /// Already normalized occupancy in `[0, 1]`.
    Ratio(f64),
    /// Absolute vehicle count.
    Count(f64),
}

impl DensityValue {
    /// Normalize into `[0, 1]`. `saturation_count` is the count treated as
    /// fully saturated. Non-finite readings normalize to `None`.
    pub fn normalized(&self, saturation_count: f64) -> Option<f64> {
        let raw = match *self {
            DensityValue::Ratio(r) => r,
            DensityValue::Count(c) => c / saturation_count,
        };
        raw.is_finite().then(|| raw.clamp(0.0, 1.0))
    }
}

/// Traffic densities for an intersection at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityObservation {
    pub intersection_id: IntersectionId,
    /// Unix timestamp (milliseconds) the readings were taken.
    pub observed_at_ms: u64,
    pub densities: BTreeMap<Approach, DensityValue>,
}

impl DensityObservation {
    pub fn new(intersection_id: impl Into<IntersectionId>, observed_at_ms: u64) -> Self {
        Self {
            intersection_id: intersection_id.into(),
            observed_at_ms,
            densities: BTreeMap::new(),
        }
    }

    pub fn with(mut self, approach: Approach, value: DensityValue) -> Self {
        self.densities.insert(approach, value);
        self
    }

    /// Age of the observation relative to `now_ms`. Readings from the
    /// future count as fresh.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.observed_at_ms))
    }
}

/// Which formula sizes an advancing phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyKind {
    /// `clamp(base * (1 + weight * density), min, max)`.
    Linear,
    /// Split `cycle_time` across phases by their share of total density.
    Proportional { cycle_time: Duration },
}

/// A validated phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// Approaches released while this phase is green.
    pub approaches: Vec<Approach>,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub base_duration: Duration,
}

/// A validated intersection configuration, as persisted by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionSpec {
    pub id: IntersectionId,
    pub name: String,
    /// Phases in their fixed cyclic order.
    pub phases: Vec<PhaseSpec>,
    pub density_weight: f64,
    /// Observations older than this are ignored.
    pub staleness_threshold: Duration,
    /// Vehicle count that maps to density 1.0.
    pub saturation_count: f64,
    pub lease_ttl: Duration,
    pub evaluation_timeout: Duration,
    pub observe_timeout: Duration,
    pub policy: PolicyKind,
}

impl IntersectionSpec {
    /// Index of the phase that follows `index` in the cycle.
    pub fn next_phase_index(&self, index: usize) -> usize {
        (index + 1) % self.phases.len()
    }

    pub fn phase(&self, index: usize) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Shortest minimum duration across all phases.
    pub fn shortest_min_duration(&self) -> Option<Duration> {
        self.phases.iter().map(|p| p.min_duration).min()
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_clamped() {
        assert_eq!(DensityValue::Ratio(1.4).normalized(40.0), Some(1.0));
        assert_eq!(DensityValue::Ratio(-0.2).normalized(40.0), Some(0.0));
        assert_eq!(DensityValue::Ratio(0.25).normalized(40.0), Some(0.25));
    }

    #[test]
    fn count_is_scaled_by_saturation() {
        assert_eq!(DensityValue::Count(20.0).normalized(40.0), Some(0.5));
        assert_eq!(DensityValue::Count(90.0).normalized(40.0), Some(1.0));
        assert_eq!(DensityValue::Count(f64::NAN).normalized(40.0), None);
    }

    #[test]
    fn observation_age_saturates() {
        let obs = DensityObservation::new("x", 10_000);
        assert_eq!(obs.age(12_500), Duration::from_millis(2_500));
        assert_eq!(obs.age(9_000), Duration::ZERO);
    }

    #[test]
    fn approach_serializes_as_compass_code() {
        let json = serde_json::to_string(&Approach::West).unwrap();
        assert_eq!(json, "\"W\"");
        let lane: Lane = serde_json::from_str("\"left\"").unwrap();
        assert_eq!(lane, Lane::Left);
    }

    #[test]
    fn lane_weights_sum_to_one() {
        let total: f64 = Lane::ALL.iter().map(Lane::weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
