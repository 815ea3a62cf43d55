//! Per-path trailing-edge debouncing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

/// Collapses bursts of changes to the same path. A path becomes due once
/// `window` has passed since its most recent change.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.deadlines.insert(path, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every path whose deadline has passed, sorted.
    pub fn drain_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.deadlines.remove(path);
        }
        due.sort();
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_on_one_path_yields_one_entry() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.push("a.js".into(), t0);
        d.push("a.js".into(), t0 + Duration::from_millis(50));
        d.push("a.js".into(), t0 + Duration::from_millis(90));

        assert!(d.drain_due(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(
            d.drain_due(t0 + Duration::from_millis(190)),
            vec![PathBuf::from("a.js")]
        );
        assert!(d.is_empty());
    }

    #[test]
    fn paths_are_debounced_independently() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.push("b.js".into(), t0);
        d.push("a.js".into(), t0 + Duration::from_millis(60));

        assert_eq!(d.next_deadline(), Some(t0 + Duration::from_millis(100)));
        assert_eq!(d.drain_due(t0 + Duration::from_millis(100)), vec![PathBuf::from("b.js")]);
        assert_eq!(d.len(), 1);
        assert_eq!(d.drain_due(t0 + Duration::from_millis(160)), vec![PathBuf::from("a.js")]);
    }
}
