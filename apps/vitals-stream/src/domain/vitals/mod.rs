//! Vitals Domain
//!
//! Per-student vitals samples and the state derived from them:
//!
//! - `sample`: validated inbound observations
//! - `status`: pure status derivation from a raw reading
//! - `roster`: per-student committed state for the monitored classroom
//! - `reducer`: debounced staging of inbound samples
//! - `liveness`: staleness sweep that downgrades silent students

pub mod liveness;
pub mod reducer;
pub mod roster;
pub mod sample;
pub mod status;

pub use liveness::{LivenessMonitor, SweepReport, format_since};
pub use reducer::{CommitReport, StageOutcome, VitalsReducer};
pub use roster::{EntityVitalsState, Liveness, Roster, RosterCounts, RosterEntry, ScopeId};
pub use sample::{EntityId, SampleError, VitalsSample};
pub use status::{StatusThresholds, VitalsStatus};
