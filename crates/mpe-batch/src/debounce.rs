//! Quiescence tracking for watcher events.
//!
//! A batch becomes due once no event has touched it for a full window.
//! Callers pass `now` explicitly so the timing is testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Quiescence {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl Quiescence {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Record activity on `name`, restarting its window.
    pub fn touch(&mut self, name: &str, now: Instant) {
        self.last_seen.insert(name.to_string(), now);
    }

    /// Remove and return every name that has been quiet for the window.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| now.saturating_duration_since(seen) >= self.window)
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        for name in &due {
            self.last_seen.remove(name);
        }
        due
    }

    pub fn contains(&self, name: &str) -> bool {
        self.last_seen.contains_key(name)
    }

    pub fn forget(&mut self, name: &str) {
        self.last_seen.remove(name);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_after_window() {
        let mut q = Quiescence::new(Duration::from_millis(500));
        let t0 = Instant::now();
        q.touch("batch-a", t0);

        assert!(q.take_due(t0 + Duration::from_millis(499)).is_empty());
        assert_eq!(q.take_due(t0 + Duration::from_millis(500)), vec!["batch-a"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_touch_restarts_window() {
        let mut q = Quiescence::new(Duration::from_secs(2));
        let t0 = Instant::now();
        q.touch("batch-a", t0);
        q.touch("batch-a", t0 + Duration::from_secs(1));

        assert!(q.take_due(t0 + Duration::from_secs(2)).is_empty());
        assert_eq!(q.take_due(t0 + Duration::from_secs(3)), vec!["batch-a"]);
    }

    #[test]
    fn test_independent_batches() {
        let mut q = Quiescence::new(Duration::from_secs(1));
        let t0 = Instant::now();
        q.touch("batch-a", t0);
        q.touch("batch-b", t0 + Duration::from_millis(800));
        q.forget("batch-c");

        assert_eq!(q.take_due(t0 + Duration::from_secs(1)), vec!["batch-a"]);
        assert_eq!(q.len(), 1);
        assert!(q.contains("batch-b"));
        assert!(!q.contains("batch-a"));
        q.forget("batch-b");
        assert!(q.is_empty());
    }
}
