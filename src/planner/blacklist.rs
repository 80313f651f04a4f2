//! Failure memo for decomposition
//!
//! Remembers (task signature, state signature) pairs whose every method
//! failed, so the search never re-explores an identical dead end.

use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashSet<(String, String)>,
    hits: u64,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check for a known dead end, counting hits
    pub fn contains(&mut self, task: &str, state: &str) -> bool {
        let found = self.entries.contains(&(task.to_string(), state.to_string()));
        if found {
            self.hits += 1;
            debug!("Blacklist hit: {} @ {}", task, &state[..state.len().min(12)]);
        }
        found
    }

    pub fn insert(&mut self, task: &str, state: &str) {
        if self.entries.insert((task.to_string(), state.to_string())) {
            debug!("Blacklisted: {} @ {}", task, &state[..state.len().min(12)]);
        }
    }

    /// Forget all entries (start of a top-level planning call)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hits since creation
    pub fn hits(&self) -> u64 {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_hit() {
        let mut bl = Blacklist::new();
        assert!(!bl.contains("deliver(box)", "abc"));
        bl.insert("deliver(box)", "abc");
        assert!(bl.contains("deliver(box)", "abc"));
        assert!(!bl.contains("deliver(box)", "def"));
        assert_eq!(bl.hits(), 1);

        bl.clear();
        assert!(bl.is_empty());
        assert_eq!(bl.hits(), 1);
    }
}
