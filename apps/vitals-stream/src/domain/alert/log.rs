//! Bounded newest-first alert history.

use std::collections::VecDeque;

use super::event::AlertEvent;

/// Newest-first alert history, bounded with drop-oldest overflow.
#[derive(Debug, Clone)]
pub struct AlertLog {
    entries: VecDeque<AlertEvent>,
    capacity: usize,
}

impl AlertLog {
    /// Create a log holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an event at the front.
    ///
    /// Returns `false` when an event with the same student id and
    /// timestamp is already present.
    pub fn record(&mut self, event: AlertEvent) -> bool {
        let duplicate = self
            .entries
            .iter()
            .any(|e| e.student_id == event.student_id && e.timestamp == event.timestamp);
        if duplicate {
            return false;
        }

        self.entries.push_front(event);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
        true
    }

    /// Remove one entry by id. Returns whether it existed.
    pub fn clear(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id() != id);
        self.entries.len() != before
    }

    /// Remove every entry.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Entries, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &AlertEvent> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured bound.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, ts: &str) -> AlertEvent {
        AlertEvent::new(id, 180.0, 170.0, ts)
    }

    #[test]
    fn newest_first() {
        let mut log = AlertLog::new(10);
        log.record(event("a", "1"));
        log.record(event("b", "2"));

        let ids: Vec<_> = log.iter().map(|e| e.student_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn dedups_by_student_and_timestamp() {
        let mut log = AlertLog::new(10);
        assert!(log.record(event("a", "1")));
        assert!(!log.record(event("a", "1")));
        assert!(log.record(event("a", "2")));
        assert!(log.record(event("b", "1")));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn drops_oldest_beyond_capacity() {
        let mut log = AlertLog::new(2);
        log.record(event("a", "1"));
        log.record(event("b", "2"));
        log.record(event("c", "3"));

        let ids: Vec<_> = log.iter().map(|e| e.student_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn clears_one_or_all() {
        let mut log = AlertLog::new(10);
        log.record(event("a", "1"));
        log.record(event("b", "2"));

        assert!(log.clear("a1"));
        assert!(!log.clear("a1"));
        assert_eq!(log.len(), 1);

        log.clear_all();
        assert!(log.is_empty());
    }
}
