//! signald.toml configuration parser.
//!
//! The file holds a `[daemon]` table and one `[[intersection]]` table per
//! intersection. Everything is parsed into loosely-typed structs first and
//! then validated into [`DaemonSettings`] and [`IntersectionSpec`]s; a
//! configuration that fails validation never reaches the scheduler.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Approach, IntersectionSpec, PhaseSpec, PolicyKind};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("intersection id must not be empty")]
    EmptyId,

    #[error("duplicate intersection id: {0}")]
    DuplicateIntersection(String),

    #[error("intersection {0} has no phases")]
    NoPhases(String),

    #[error("intersection {intersection}: duplicate phase {phase}")]
    DuplicatePhase { intersection: String, phase: String },

    #[error("intersection {intersection}: phase {phase} serves no approaches")]
    NoApproaches { intersection: String, phase: String },

    #[error("intersection {intersection}: phase {phase}: {reason}")]
    PhaseBounds {
        intersection: String,
        phase: String,
        reason: String,
    },

    #[error("intersection {intersection}: {reason}")]
    Invalid { intersection: String, reason: String },

    #[error("unknown policy {policy:?} for intersection {intersection}")]
    UnknownPolicy { intersection: String, policy: String },

    #[error("daemon tick {tick:?} must be shorter than the shortest phase minimum {min:?}")]
    TickTooSlow { tick: Duration, min: Duration },

    #[error("daemon: {0}")]
    Daemon(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default, rename = "intersection")]
    pub intersections: Vec<IntersectionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Trigger cadence (e.g., "1s").
    pub tick: Option<String>,
    /// Bound on a single state store call.
    pub store_timeout: Option<String>,
    /// Maximum evaluations in flight at once.
    pub max_concurrency: Option<usize>,
    /// Feed the observer with generated traffic.
    pub synthetic_feed: Option<bool>,
    pub feed_interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntersectionConfig {
    pub id: String,
    pub name: Option<String>,
    pub density_weight: Option<f64>,
    /// Maximum observation age (e.g., "30s").
    pub staleness: Option<String>,
    pub saturation_count: Option<f64>,
    pub lease_ttl: Option<String>,
    pub evaluation_timeout: Option<String>,
    pub observe_timeout: Option<String>,
    /// "linear" or "proportional".
    pub policy: Option<String>,
    /// Cycle length split by the proportional policy.
    pub cycle_time: Option<String>,
    #[serde(default, rename = "phase")]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub approaches: Vec<Approach>,
    pub min: String,
    pub max: String,
    pub base: String,
}

/// Validated daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub tick: Duration,
    pub store_timeout: Duration,
    pub max_concurrency: usize,
    pub synthetic_feed: bool,
    pub feed_interval: Duration,
}

/// A fully validated configuration.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub daemon: DaemonSettings,
    pub intersections: Vec<IntersectionSpec>,
}

impl SignalConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate every section. The daemon tick must be shorter than the
    /// shortest phase minimum across all intersections so that no phase
    /// overruns its planned duration by more than one tick.
    pub fn validate(&self) -> ConfigResult<ValidatedConfig> {
        let daemon = self.daemon.validate()?;

        let mut seen = HashSet::new();
        let mut intersections = Vec::with_capacity(self.intersections.len());
        for raw in &self.intersections {
            let spec = raw.validate()?;
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::DuplicateIntersection(spec.id));
            }
            intersections.push(spec);
        }

        if let Some(min) = intersections
            .iter()
            .filter_map(IntersectionSpec::shortest_min_duration)
            .min()
            && daemon.tick >= min
        {
            return Err(ConfigError::TickTooSlow {
                tick: daemon.tick,
                min,
            });
        }

        Ok(ValidatedConfig {
            daemon,
            intersections,
        })
    }

    /// Scaffold a config with a single four-way intersection.
    pub fn scaffold(id: &str) -> Self {
        let phase = |name: &str, approaches: Vec<Approach>| PhaseConfig {
            name: name.to_string(),
            approaches,
            min: "10s".to_string(),
            max: "60s".to_string(),
            base: "30s".to_string(),
        };
        SignalConfig {
            daemon: DaemonConfig {
                tick: Some("1s".to_string()),
                store_timeout: Some("2s".to_string()),
                max_concurrency: Some(16),
                synthetic_feed: Some(true),
                feed_interval: Some("5s".to_string()),
            },
            intersections: vec![IntersectionConfig {
                id: id.to_string(),
                name: None,
                density_weight: Some(1.0),
                staleness: Some("30s".to_string()),
                saturation_count: Some(40.0),
                lease_ttl: Some("10s".to_string()),
                evaluation_timeout: Some("5s".to_string()),
                observe_timeout: Some("2s".to_string()),
                policy: Some("linear".to_string()),
                cycle_time: None,
                phases: vec![
                    phase("north-south", vec![Approach::North, Approach::South]),
                    phase("east-west", vec![Approach::East, Approach::West]),
                ],
            }],
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> ConfigResult<DaemonSettings> {
        let tick = duration_or("daemon.tick", self.tick.as_deref(), "1s")?;
        if tick.is_zero() {
            return Err(ConfigError::Daemon("tick must be positive".to_string()));
        }
        let max_concurrency = self.max_concurrency.unwrap_or(16);
        if max_concurrency == 0 {
            return Err(ConfigError::Daemon(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(DaemonSettings {
            tick,
            store_timeout: duration_or("daemon.store_timeout", self.store_timeout.as_deref(), "2s")?,
            max_concurrency,
            synthetic_feed: self.synthetic_feed.unwrap_or(false),
            feed_interval: duration_or("daemon.feed_interval", self.feed_interval.as_deref(), "5s")?,
        })
    }
}

impl IntersectionConfig {
    pub fn validate(&self) -> ConfigResult<IntersectionSpec> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases(id.to_string()));
        }

        let invalid = |reason: &str| ConfigError::Invalid {
            intersection: id.to_string(),
            reason: reason.to_string(),
        };

        let mut names = HashSet::new();
        let mut phases = Vec::with_capacity(self.phases.len());
        for raw in &self.phases {
            if !names.insert(raw.name.as_str()) {
                return Err(ConfigError::DuplicatePhase {
                    intersection: id.to_string(),
                    phase: raw.name.clone(),
                });
            }
            phases.push(raw.validate(id)?);
        }

        let density_weight = self.density_weight.unwrap_or(1.0);
        if !density_weight.is_finite() || density_weight < 0.0 {
            return Err(invalid("density_weight must be a non-negative number"));
        }
        let saturation_count = self.saturation_count.unwrap_or(40.0);
        if !saturation_count.is_finite() || saturation_count <= 0.0 {
            return Err(invalid("saturation_count must be positive"));
        }

        let field = |name: &str| format!("{id}.{name}");
        let lease_ttl = duration_or(&field("lease_ttl"), self.lease_ttl.as_deref(), "10s")?;
        let evaluation_timeout = duration_or(
            &field("evaluation_timeout"),
            self.evaluation_timeout.as_deref(),
            "5s",
        )?;
        let observe_timeout =
            duration_or(&field("observe_timeout"), self.observe_timeout.as_deref(), "2s")?;

        if lease_ttl.is_zero() {
            return Err(invalid("lease_ttl must be positive"));
        }
        if lease_ttl < evaluation_timeout {
            return Err(invalid("lease_ttl must cover evaluation_timeout"));
        }
        if observe_timeout > evaluation_timeout {
            return Err(invalid("observe_timeout must not exceed evaluation_timeout"));
        }

        let policy = match self.policy.as_deref().unwrap_or("linear") {
            "linear" => PolicyKind::Linear,
            "proportional" => {
                let cycle_time =
                    duration_or(&field("cycle_time"), self.cycle_time.as_deref(), "60s")?;
                if cycle_time.is_zero() {
                    return Err(invalid("cycle_time must be positive"));
                }
                PolicyKind::Proportional { cycle_time }
            }
            other => {
                return Err(ConfigError::UnknownPolicy {
                    intersection: id.to_string(),
                    policy: other.to_string(),
                });
            }
        };

        Ok(IntersectionSpec {
            id: id.to_string(),
            name: self.name.clone().unwrap_or_else(|| id.to_string()),
            phases,
            density_weight,
            staleness_threshold: duration_or(&field("staleness"), self.staleness.as_deref(), "30s")?,
            saturation_count,
            lease_ttl,
            evaluation_timeout,
            observe_timeout,
            policy,
        })
    }
}

impl PhaseConfig {
    fn validate(&self, intersection: &str) -> ConfigResult<PhaseSpec> {
        let bounds = |reason: &str| ConfigError::PhaseBounds {
            intersection: intersection.to_string(),
            phase: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.approaches.is_empty() {
            return Err(ConfigError::NoApproaches {
                intersection: intersection.to_string(),
                phase: self.name.clone(),
            });
        }

        let field = |name: &str| format!("{intersection}.{}.{name}", self.name);
        let min_duration = parse_duration(&field("min"), &self.min)?;
        let max_duration = parse_duration(&field("max"), &self.max)?;
        let base_duration = parse_duration(&field("base"), &self.base)?;

        if min_duration.is_zero() {
            return Err(bounds("min must be positive"));
        }
        if min_duration > max_duration {
            return Err(bounds("min exceeds max"));
        }
        if base_duration < min_duration || base_duration > max_duration {
            return Err(bounds("base must lie within [min, max]"));
        }

        Ok(PhaseSpec {
            name: self.name.clone(),
            approaches: self.approaches.clone(),
            min_duration,
            max_duration,
            base_duration,
        })
    }
}

/// Parse a human duration such as "30s" or "500ms".
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|_| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn duration_or(field: &str, value: Option<&str>, default: &str) -> ConfigResult<Duration> {
    parse_duration(field, value.unwrap_or(default))
}
