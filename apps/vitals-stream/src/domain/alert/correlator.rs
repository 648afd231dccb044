//! Alert Correlation
//!
//! Derives the live alert set from recent alert times and overlays
//! `Warning` onto the roster for students inside it.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::domain::vitals::{EntityId, Liveness, Roster, StatusThresholds, VitalsStatus};

/// Difference between two consecutive alert sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationChange {
    /// Entities that entered the set.
    pub raised: Vec<EntityId>,
    /// Entities that left the set.
    pub released: Vec<EntityId>,
}

impl CorrelationChange {
    /// Whether the set did not change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.released.is_empty()
    }
}

/// Tracks which students are currently alerted.
///
/// Each student in the feed stays alerted for `hold` after their most
/// recent alert. The derived set is compared with the previous one on
/// every recompute and the difference is applied to the roster.
#[derive(Debug, Clone)]
pub struct AlertCorrelator {
    hold: Duration,
    feed: HashMap<EntityId, Instant>,
    active: BTreeSet<EntityId>,
}

impl AlertCorrelator {
    /// Create a correlator with the given hold window.
    #[must_use]
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            feed: HashMap::new(),
            active: BTreeSet::new(),
        }
    }

    /// Record a streamed alert for a student.
    pub fn observe(&mut self, entity: impl Into<EntityId>, now: Instant) {
        self.feed.insert(entity.into(), now);
    }

    /// Replace the whole feed with a fetched snapshot.
    pub fn replace_feed(&mut self, entities: impl IntoIterator<Item = EntityId>, now: Instant) {
        self.feed = entities.into_iter().map(|id| (id, now)).collect();
    }

    /// Expire old feed entries and diff the resulting set.
    pub fn recompute(&mut self, now: Instant) -> CorrelationChange {
        let hold = self.hold;
        self.feed
            .retain(|_, seen| now.saturating_duration_since(*seen) <= hold);

        let next: BTreeSet<EntityId> = self.feed.keys().cloned().collect();
        let change = CorrelationChange {
            raised: next.difference(&self.active).cloned().collect(),
            released: self.active.difference(&next).cloned().collect(),
        };
        self.active = next;
        change
    }

    /// Overlay a change onto the roster.
    ///
    /// Raised students are forced to `Warning`. Released students get the
    /// status derived from their last reading, or `Inactive` when they are
    /// not online or have no reading.
    pub fn apply(change: &CorrelationChange, roster: &mut Roster, thresholds: &StatusThresholds) {
        for id in &change.raised {
            if let Some(state) = roster.get_mut(id) {
                state.status = VitalsStatus::Warning;
            }
        }

        for id in &change.released {
            let Some(state) = roster.get_mut(id) else {
                continue;
            };
            if state.status != VitalsStatus::Warning {
                continue;
            }
            state.status = match (&state.latest, state.liveness) {
                (Some(sample), Liveness::Online) => thresholds.derive(sample),
                _ => VitalsStatus::Inactive,
            };
        }
    }

    /// Whether a student is in the active set.
    #[must_use]
    pub fn is_alerted(&self, id: &str) -> bool {
        self.active.contains(id)
    }

    /// Active set in id order.
    #[must_use]
    pub const fn active(&self) -> &BTreeSet<EntityId> {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::vitals::{RosterEntry, VitalsReducer, VitalsSample};

    const HOLD: Duration = Duration::from_secs(60);

    fn roster_with(readings: &[(&str, f64)], at: Instant) -> Roster {
        let mut roster = Roster::new();
        roster.reset(
            Some("42".into()),
            readings.iter().map(|(id, _)| RosterEntry::new(*id, None)),
        );
        let mut reducer = VitalsReducer::new();
        for (id, hr) in readings {
            reducer
                .stage(&roster, VitalsSample::new(*id, Some(*hr), None))
                .unwrap();
        }
        reducer.commit(
            &mut roster,
            &BTreeSet::new(),
            &StatusThresholds::default(),
            at,
            Utc::now(),
        );
        roster
    }

    #[test]
    fn raise_forces_warning_and_release_rederives() {
        let now = Instant::now();
        let thresholds = StatusThresholds::default();
        let mut roster = roster_with(&[("s1", 72.0), ("s2", 130.0)], now);
        let mut correlator = AlertCorrelator::new(HOLD);

        correlator.observe("s1", now);
        correlator.observe("s2", now);
        let change = correlator.recompute(now);
        assert_eq!(change.raised, vec!["s1".to_string(), "s2".to_string()]);
        AlertCorrelator::apply(&change, &mut roster, &thresholds);
        assert_eq!(roster.get("s1").unwrap().status, VitalsStatus::Warning);
        assert_eq!(roster.get("s2").unwrap().status, VitalsStatus::Warning);

        correlator.replace_feed(Vec::new(), now);
        let change = correlator.recompute(now);
        assert_eq!(change.released.len(), 2);
        AlertCorrelator::apply(&change, &mut roster, &thresholds);
        assert_eq!(roster.get("s1").unwrap().status, VitalsStatus::Excellent);
        assert_eq!(roster.get("s2").unwrap().status, VitalsStatus::Good);
    }

    #[test]
    fn unchanged_set_yields_empty_change() {
        let now = Instant::now();
        let mut correlator = AlertCorrelator::new(HOLD);
        correlator.observe("s1", now);
        assert!(!correlator.recompute(now).is_empty());

        correlator.observe("s1", now + Duration::from_secs(1));
        assert!(correlator.recompute(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn alerts_expire_after_hold() {
        let now = Instant::now();
        let mut correlator = AlertCorrelator::new(HOLD);
        correlator.observe("s1", now);
        correlator.recompute(now);

        let later = now + HOLD + Duration::from_secs(1);
        let change = correlator.recompute(later);
        assert_eq!(change.released, vec!["s1".to_string()]);
        assert!(!correlator.is_alerted("s1"));
    }

    #[test]
    fn release_of_offline_student_is_inactive() {
        let now = Instant::now();
        let thresholds = StatusThresholds::default();
        let mut roster = roster_with(&[("s1", 72.0)], now);
        let mut correlator = AlertCorrelator::new(HOLD);

        correlator.observe("s1", now);
        let change = correlator.recompute(now);
        AlertCorrelator::apply(&change, &mut roster, &thresholds);
        roster.get_mut("s1").unwrap().liveness = Liveness::Offline;

        correlator.replace_feed(Vec::new(), now);
        let change = correlator.recompute(now);
        AlertCorrelator::apply(&change, &mut roster, &thresholds);
        assert_eq!(roster.get("s1").unwrap().status, VitalsStatus::Inactive);
    }

    #[test]
    fn unknown_students_are_tracked_but_not_applied() {
        let now = Instant::now();
        let mut roster = roster_with(&[("s1", 72.0)], now);
        let mut correlator = AlertCorrelator::new(HOLD);

        correlator.observe("ghost", now);
        let change = correlator.recompute(now);
        AlertCorrelator::apply(&change, &mut roster, &StatusThresholds::default());
        assert!(correlator.is_alerted("ghost"));
        assert_eq!(roster.get("s1").unwrap().status, VitalsStatus::Excellent);
    }
}
