// Delta tracker
//
// Turns readings that are monotonic at the source (but may reset) into
// non-negative increments for a local monotonic counter.

use std::collections::HashMap;
use std::hash::Hash;

/// Last-seen raw readings, keyed by whatever identifies a series
///
/// The first reading for a key only establishes a baseline. Afterwards the
/// increment is `raw - last` when positive and zero otherwise; the baseline
/// always moves to the newest reading so a source reset is absorbed.
#[derive(Debug)]
pub struct DeltaTracker<K> {
    last: HashMap<K, f64>,
}

impl<K: Eq + Hash> DeltaTracker<K> {
    pub fn new() -> Self {
        DeltaTracker {
            last: HashMap::new(),
        }
    }

    /// Records `raw` for `key` and returns the increment to apply
    pub fn apply(&mut self, key: K, raw: f64) -> f64 {
        match self.last.insert(key, raw) {
            Some(previous) if raw > previous => raw - previous,
            _ => 0.0,
        }
    }

    /// Records `raw` for `key`, counting an unseen key from zero
    ///
    /// Used for series that appear after their family was first observed:
    /// everything they report accumulated while the collector was watching.
    pub fn apply_from_zero(&mut self, key: K, raw: f64) -> f64 {
        let previous = self.last.insert(key, raw).unwrap_or(0.0);
        if raw > previous {
            raw - previous
        } else {
            0.0
        }
    }

    /// Last raw reading recorded for `key`
    #[cfg(test)]
    pub fn last(&self, key: &K) -> Option<f64> {
        self.last.get(key).copied()
    }
}

impl<K: Eq + Hash> Default for DeltaTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
