//! Roster
//!
//! Committed per-student state for the currently monitored classroom.
//! Every roster change that moves to a different classroom opens a new
//! [`ScopeId`]; samples staged under an older scope are discarded at
//! commit time.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sample::{EntityId, VitalsSample};
use super::status::VitalsStatus;

/// Generation counter of the monitored scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Raw generation number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Connectivity of a student as seen through their vitals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// No sample committed since the roster was set.
    NeverSeen,
    /// Last sample is fresh.
    Online,
    /// Last sample is older than the offline threshold.
    Offline,
}

/// One roster member as listed by the roster source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Student id.
    #[serde(alias = "physicalId")]
    pub student_id: EntityId,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

impl RosterEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(student_id: impl Into<EntityId>, name: Option<String>) -> Self {
        Self {
            student_id: student_id.into(),
            name,
        }
    }
}

/// Committed state of one student.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVitalsState {
    /// Student id.
    pub student_id: EntityId,
    /// Display name.
    pub name: Option<String>,
    /// Most recently committed sample.
    pub latest: Option<VitalsSample>,
    /// Monotonic time of the last commit.
    #[serde(skip)]
    pub last_update: Option<Instant>,
    /// Wall-clock time of the last commit.
    pub last_update_at: Option<DateTime<Utc>>,
    /// Human-readable age of the last commit.
    pub since_update: Option<String>,
    /// Display tier.
    pub status: VitalsStatus,
    /// Connectivity.
    pub liveness: Liveness,
}

impl EntityVitalsState {
    fn from_entry(entry: RosterEntry) -> Self {
        Self {
            student_id: entry.student_id,
            name: entry.name,
            latest: None,
            last_update: None,
            last_update_at: None,
            since_update: None,
            status: VitalsStatus::Inactive,
            liveness: Liveness::NeverSeen,
        }
    }

    /// Whether the student is currently online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }
}

/// Aggregate counts over the roster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterCounts {
    /// Students in the roster.
    pub total: usize,
    /// Online students.
    pub online: usize,
    /// Offline students.
    pub offline: usize,
    /// Students never seen.
    pub never_seen: usize,
    /// Students in `Warning`.
    pub warning: usize,
}

/// Committed state for the monitored classroom.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    scope: ScopeId,
    classroom_id: Option<String>,
    entities: BTreeMap<EntityId, EntityVitalsState>,
}

impl Roster {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the monitored scope.
    ///
    /// Moving to a different classroom opens a new scope and starts every
    /// member from scratch. Refreshing the roster of the same classroom
    /// keeps committed state for members that remain and drops the rest.
    pub fn reset(
        &mut self,
        classroom_id: Option<String>,
        entries: impl IntoIterator<Item = RosterEntry>,
    ) -> ScopeId {
        let same_scope = classroom_id == self.classroom_id;
        let mut previous = if same_scope {
            std::mem::take(&mut self.entities)
        } else {
            self.scope = self.scope.next();
            self.entities.clear();
            BTreeMap::new()
        };

        self.classroom_id = classroom_id;
        for entry in entries {
            let state = match previous.remove(&entry.student_id) {
                Some(mut kept) => {
                    if entry.name.is_some() {
                        kept.name = entry.name;
                    }
                    kept
                }
                None => EntityVitalsState::from_entry(entry),
            };
            self.entities.insert(state.student_id.clone(), state);
        }
        self.scope
    }

    /// Current scope.
    #[must_use]
    pub const fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Monitored classroom, if any.
    #[must_use]
    pub fn classroom_id(&self) -> Option<&str> {
        self.classroom_id.as_deref()
    }

    /// Whether a student is tracked.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Whether a sample belongs to the monitored scope.
    ///
    /// A sample without a classroom id is accepted for any tracked student.
    #[must_use]
    pub fn accepts(&self, sample: &VitalsSample) -> bool {
        let classroom_ok = match (&self.classroom_id, &sample.classroom_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        };
        classroom_ok && self.contains(&sample.entity_id)
    }

    /// State of one student.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&EntityVitalsState> {
        self.entities.get(id)
    }

    /// Mutable state of one student.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut EntityVitalsState> {
        self.entities.get_mut(id)
    }

    /// All students ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &EntityVitalsState> {
        self.entities.values()
    }

    /// All students ordered by id, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EntityVitalsState> {
        self.entities.values_mut()
    }

    /// Number of tracked students.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the roster is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Aggregate counts.
    #[must_use]
    pub fn counts(&self) -> RosterCounts {
        self.iter().fold(
            RosterCounts {
                total: self.len(),
                ..RosterCounts::default()
            },
            |mut counts, state| {
                match state.liveness {
                    Liveness::Online => counts.online += 1,
                    Liveness::Offline => counts.offline += 1,
                    Liveness::NeverSeen => counts.never_seen += 1,
                }
                if state.status == VitalsStatus::Warning {
                    counts.warning += 1;
                }
                counts
            },
        )
    }
}
