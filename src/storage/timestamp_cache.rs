use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Bounded timestamp -> row key cache. Entries leave in insertion order; a
/// hit does not refresh an entry's position.
#[derive(Debug, Clone)]
pub struct TimestampCache {
    capacity: usize,
    entries: VecDeque<(DateTime<Utc>, i64)>,
}

impl TimestampCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn get(&self, timestamp: &DateTime<Utc>) -> Option<i64> {
        self.entries
            .iter()
            .find(|(ts, _)| ts == timestamp)
            .map(|(_, pk)| *pk)
    }

    /// Adds a mapping and returns the evicted oldest entry, if any.
    pub fn insert(&mut self, timestamp: DateTime<Utc>, pk: i64) -> Option<(DateTime<Utc>, i64)> {
        if let Some(entry) = self.entries.iter_mut().find(|(ts, _)| *ts == timestamp) {
            entry.1 = pk;
            return None;
        }
        self.entries.push_back((timestamp, pk));
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Cached timestamps, oldest first.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.entries.iter().map(|(ts, _)| *ts).collect()
    }
}
