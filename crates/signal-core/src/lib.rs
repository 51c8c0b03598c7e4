//! signal-core: shared types, configuration and phase planning for
//! SignalGrid.
//!
//! Everything in this crate is synchronous and free of I/O apart from
//! reading a config file, so the planner can be tested directly.

pub mod config;
pub mod planner;
pub mod types;

pub use config::{
    ConfigError, ConfigResult, DaemonSettings, IntersectionConfig, PhaseConfig, SignalConfig,
    ValidatedConfig,
};
pub use planner::{
    DurationPolicy, LinearClamp, PhasePlan, PlanInput, PlanKind, ProportionalSplit, plan,
    plan_with,
};
pub use types::*;
