use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntry {
    pub object_name: String,
    /// Creation timestamp of the inserted record.
    pub timestamp: String,
}

/// Most-recent-first list of inserts into user objects.
#[derive(Debug)]
pub struct RecentActivity {
    capacity: usize,
    entries: Mutex<VecDeque<RecentEntry>>,
}

impl RecentActivity {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, object_name: &str, timestamp: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_front(RecentEntry {
            object_name: object_name.to_string(),
            timestamp: timestamp.to_string(),
        });
        entries.truncate(self.capacity);
    }

    /// Replace the contents with the newest `capacity` of `entries`.
    pub fn seed(&self, mut entries: Vec<RecentEntry>) {
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(self.capacity);
        *self.entries.lock() = entries.into();
    }

    pub fn snapshot(&self) -> Vec<RecentEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ts: &str) -> RecentEntry {
        RecentEntry {
            object_name: name.into(),
            timestamp: ts.into(),
        }
    }

    #[test]
    fn newest_first_and_bounded() {
        let recent = RecentActivity::new(2);
        recent.record("A", "2024-01-01T00:00:01.000000Z");
        recent.record("B", "2024-01-01T00:00:02.000000Z");
        recent.record("C", "2024-01-01T00:00:03.000000Z");
        let names: Vec<String> = recent.snapshot().into_iter().map(|e| e.object_name).collect();
        assert_eq!(names, vec!["C", "B"]);
    }

    #[test]
    fn seed_keeps_newest_across_objects() {
        let recent = RecentActivity::new(2);
        recent.seed(vec![
            entry("A", "2024-01-01T00:00:01.000000Z"),
            entry("B", "2024-01-01T00:00:03.000000Z"),
            entry("A", "2024-01-01T00:00:02.000000Z"),
        ]);
        assert_eq!(
            recent.snapshot(),
            vec![
                entry("B", "2024-01-01T00:00:03.000000Z"),
                entry("A", "2024-01-01T00:00:02.000000Z"),
            ]
        );
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let recent = RecentActivity::new(0);
        recent.record("A", "t");
        assert!(recent.snapshot().is_empty());
    }
}
