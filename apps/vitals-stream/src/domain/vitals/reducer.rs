//! Vitals Reducer
//!
//! Inbound samples are staged per student (last write wins) and applied
//! to the roster in one batch when the debounce window closes. Each
//! staged sample remembers the scope it arrived under so a roster change
//! between staging and commit cannot leak samples into the new scope.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};

use super::liveness::format_since;
use super::roster::{Liveness, Roster, ScopeId};
use super::sample::{EntityId, SampleError, VitalsSample};
use super::status::{StatusThresholds, VitalsStatus};

/// Result of staging one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// First pending sample for the student in this window.
    Staged,
    /// Replaced an earlier pending sample for the student.
    Replaced,
    /// Student or classroom is outside the monitored scope.
    OutOfScope,
}

/// Result of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Students whose state was updated.
    pub applied: Vec<EntityId>,
    /// Staged samples dropped because their scope went stale.
    pub discarded: usize,
}

#[derive(Debug, Clone)]
struct StagedSample {
    scope: ScopeId,
    sample: VitalsSample,
}

/// Debounced staging area for inbound samples.
#[derive(Debug, Default)]
pub struct VitalsReducer {
    staged: HashMap<EntityId, StagedSample>,
}

impl VitalsReducer {
    /// Create an empty reducer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and stage a sample under the roster's current scope.
    ///
    /// # Errors
    ///
    /// Returns `SampleError` when the sample fails validation.
    pub fn stage(
        &mut self,
        roster: &Roster,
        sample: VitalsSample,
    ) -> Result<StageOutcome, SampleError> {
        sample.validate()?;
        if !roster.accepts(&sample) {
            return Ok(StageOutcome::OutOfScope);
        }

        let staged = StagedSample {
            scope: roster.scope(),
            sample,
        };
        let outcome = match self.staged.insert(staged.sample.entity_id.clone(), staged) {
            Some(_) => StageOutcome::Replaced,
            None => StageOutcome::Staged,
        };
        Ok(outcome)
    }

    /// Number of pending samples.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.staged.is_empty()
    }

    /// Drop pending samples that no longer belong to the roster.
    pub fn prune(&mut self, roster: &Roster) -> usize {
        let before = self.staged.len();
        self.staged
            .retain(|id, staged| staged.scope == roster.scope() && roster.contains(id));
        before - self.staged.len()
    }

    /// Apply every pending sample to the roster.
    ///
    /// Students in `alerted` keep `Warning`; everyone else gets the status
    /// derived from the new reading.
    pub fn commit(
        &mut self,
        roster: &mut Roster,
        alerted: &BTreeSet<EntityId>,
        thresholds: &StatusThresholds,
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> CommitReport {
        let mut report = CommitReport::default();
        let scope = roster.scope();

        for (id, staged) in self.staged.drain() {
            if staged.scope != scope {
                report.discarded += 1;
                continue;
            }
            let Some(state) = roster.get_mut(&id) else {
                report.discarded += 1;
                continue;
            };

            state.status = if alerted.contains(&id) {
                VitalsStatus::Warning
            } else {
                thresholds.derive(&staged.sample)
            };
            state.latest = Some(staged.sample);
            state.last_update = Some(now);
            state.last_update_at = Some(wall_clock);
            state.since_update = Some(format_since(std::time::Duration::ZERO));
            state.liveness = Liveness::Online;
            report.applied.push(id);
        }

        report.applied.sort();
        report
    }
}
