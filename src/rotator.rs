//! Round-robin rotation over a pool of resources (models, API tokens).

use serde::Serialize;
use std::sync::Mutex;

/// Snapshot of rotation progress for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct RotatorStats {
    pub total_items: usize,
    pub current_index: usize,
    pub current_uses: usize,
    pub rotate_threshold: usize,
}

#[derive(Debug)]
struct RotatorState<T> {
    items: Vec<T>,
    uses_per_rotation: usize,
    current_index: usize,
    current_uses: usize,
}

/// Generic manager for rotating resources based on a uses-per-rotation
/// window. All operations are atomic; a plain mutex is enough since every
/// operation is O(1) and contention is negligible.
#[derive(Debug)]
pub struct Rotator<T> {
    inner: Mutex<RotatorState<T>>,
}

impl<T: Clone> Default for Rotator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Rotator<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RotatorState {
                items: Vec::new(),
                uses_per_rotation: 1,
                current_index: 0,
                current_uses: 0,
            }),
        }
    }

    /// Replace the resource pool and reset all counters. `uses_per_rotation`
    /// is clamped to at least 1.
    pub fn set_items(&self, items: Vec<T>, uses_per_rotation: usize) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.items = items;
        state.uses_per_rotation = uses_per_rotation.max(1);
        // Resetting avoids an out-of-range index if the pool shrank.
        state.current_index = 0;
        state.current_uses = 0;
    }

    /// Return the current resource and count one use, advancing to the next
    /// item once the window is exhausted. The threshold check happens
    /// *before* the increment, so the first call of a fresh window still
    /// returns the current item.
    pub fn get_next(&self) -> Option<T> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.items.is_empty() {
            return None;
        }

        if state.current_uses >= state.uses_per_rotation {
            state.current_index = (state.current_index + 1) % state.items.len();
            state.current_uses = 0;
        }

        state.current_uses += 1;
        Some(state.items[state.current_index].clone())
    }

    /// Peek at the current resource without counting a use.
    pub fn peek(&self) -> Option<T> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.items.is_empty() {
            return None;
        }
        Some(state.items[state.current_index].clone())
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .is_empty()
    }

    pub fn stats(&self) -> RotatorStats {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        RotatorStats {
            total_items: state.items.len(),
            current_index: state.current_index,
            current_uses: state.current_uses,
            rotate_threshold: state.uses_per_rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_pool_yields_none() {
        let rotator: Rotator<String> = Rotator::new();
        assert_eq!(rotator.get_next(), None);
        assert_eq!(rotator.peek(), None);
        assert!(rotator.is_empty());
    }

    #[test]
    fn test_single_full_cycle() {
        let rotator = Rotator::new();
        rotator.set_items(vec!["a", "b", "c"], 2);

        // k=3 items, r=2 uses: exactly one full cycle in k*r calls.
        let cycle: Vec<_> = (0..6).filter_map(|_| rotator.get_next()).collect();
        assert_eq!(cycle, vec!["a", "a", "b", "b", "c", "c"]);

        // The next call wraps back to the first item.
        assert_eq!(rotator.get_next(), Some("a"));
    }

    #[test]
    fn test_fair_distribution() {
        let rotator = Rotator::new();
        rotator.set_items(vec![1, 2, 3], 3);

        // Over N calls each item appears floor(N/(k*r)) or ceil(N/(k*r)) times
        // per window; with N=100, k=3, r=3 counts may differ by at most r.
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(rotator.get_next().unwrap()).or_default() += 1;
        }
        let min = counts.values().min().unwrap();
        let max = counts.values().max().unwrap();
        assert!(max - min <= 3, "unfair rotation: {counts:?}");
    }

    #[test]
    fn test_peek_does_not_advance() {
        let rotator = Rotator::new();
        rotator.set_items(vec!["x", "y"], 1);

        assert_eq!(rotator.peek(), Some("x"));
        assert_eq!(rotator.peek(), Some("x"));
        assert_eq!(rotator.get_next(), Some("x"));
        assert_eq!(rotator.get_next(), Some("y"));
    }

    #[test]
    fn test_set_items_resets_counters() {
        let rotator = Rotator::new();
        rotator.set_items(vec!["a", "b", "c"], 1);
        rotator.get_next();
        rotator.get_next();

        rotator.set_items(vec!["z"], 1);
        let stats = rotator.stats();
        assert_eq!(stats.current_index, 0);
        assert_eq!(stats.current_uses, 0);
        assert_eq!(rotator.get_next(), Some("z"));
        assert_eq!(rotator.get_next(), Some("z"));
    }

    #[test]
    fn test_uses_per_rotation_clamped() {
        let rotator = Rotator::new();
        rotator.set_items(vec!["a", "b"], 0);
        assert_eq!(rotator.stats().rotate_threshold, 1);
        assert_eq!(rotator.get_next(), Some("a"));
        assert_eq!(rotator.get_next(), Some("b"));
    }
}
