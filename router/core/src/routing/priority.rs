//! Priority Index
//!
//! The ordered candidate list kept for a single metric key. Entries are
//! sorted by `(priority, created_at, backend)` ascending, so [`PriorityIndex::best`]
//! is always the first element.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptor::{BackendDescriptor, BackendId};

/// A backend's projection inside a [`PriorityIndex`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CandidateEntry {
    /// Identity of the candidate backend
    pub backend: BackendId,
    /// Selection priority (lower wins)
    pub priority: i32,
    /// Registration timestamp (earlier wins on equal priority)
    pub created_at: DateTime<Utc>,
}

impl CandidateEntry {
    /// Project a descriptor into a candidate entry
    #[must_use]
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        Self {
            backend: descriptor.id().clone(),
            priority: descriptor.priority(),
            created_at: descriptor.created_at(),
        }
    }

    fn sort_key(&self) -> (i32, DateTime<Utc>, &BackendId) {
        (self.priority, self.created_at, &self.backend)
    }
}

/// Candidates for one metric key, best first
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PriorityIndex {
    entries: Vec<CandidateEntry>,
}

impl PriorityIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, replacing any entry for the same backend
    pub fn upsert(&mut self, entry: CandidateEntry) {
        match self.entries.iter_mut().find(|e| e.backend == entry.backend) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.sort();
    }

    /// Remove the entry for `backend` if present
    ///
    /// Returns whether the index is now empty, so the owner can prune it.
    pub fn remove(&mut self, backend: &BackendId) -> bool {
        self.entries.retain(|e| &e.backend != backend);
        self.entries.is_empty()
    }

    /// The winning candidate, if any
    #[must_use]
    pub fn best(&self) -> Option<&CandidateEntry> {
        self.entries.first()
    }

    /// All candidates, best first
    #[must_use]
    pub fn entries(&self) -> &[CandidateEntry] {
        &self.entries
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no candidates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: &str, priority: i32, created: i64) -> CandidateEntry {
        CandidateEntry {
            backend: BackendId::new("ns", name),
            priority,
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
        }
    }

    fn order(index: &PriorityIndex) -> Vec<&str> {
        index.entries().iter().map(|e| e.backend.name.as_str()).collect()
    }

    #[test]
    fn test_lower_priority_wins() {
        let mut index = PriorityIndex::new();
        index.upsert(entry("a", 2, 0));
        index.upsert(entry("b", 1, 10));
        assert_eq!(index.best().unwrap().backend.name, "b");
    }

    #[test]
    fn test_created_at_breaks_priority_ties() {
        let mut index = PriorityIndex::new();
        index.upsert(entry("late", 1, 20));
        index.upsert(entry("early", 1, 10));
        assert_eq!(order(&index), vec!["early", "late"]);
    }

    #[test]
    fn test_identity_breaks_exact_ties() {
        let mut index = PriorityIndex::new();
        index.upsert(entry("zeta", 1, 10));
        index.upsert(entry("alpha", 1, 10));
        assert_eq!(order(&index), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut index = PriorityIndex::new();
        index.upsert(entry("a", 1, 0));
        index.upsert(entry("b", 2, 0));
        index.upsert(entry("a", 3, 0));

        assert_eq!(index.len(), 2);
        assert_eq!(order(&index), vec!["b", "a"]);
    }

    #[test]
    fn test_remove_reports_empty() {
        let mut index = PriorityIndex::new();
        index.upsert(entry("a", 1, 0));
        index.upsert(entry("b", 1, 1));

        assert!(!index.remove(&BackendId::new("ns", "a")));
        assert!(!index.remove(&BackendId::new("ns", "missing")));
        assert!(index.remove(&BackendId::new("ns", "b")));
        assert!(index.best().is_none());
    }
}
