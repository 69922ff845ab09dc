//! In-progress registry
//!
//! Process-wide bookkeeping for the at-most-one-in-progress invariant: the
//! set of (source, destination) pairs with an active upload and the time each
//! pair last started one. The main loop acquires a pair optimistically before
//! enqueueing; either the main loop (no work) or the owning worker (batch
//! drained) releases it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Shared in-progress and last-exec maps, each behind its own lock
#[derive(Debug, Default)]
pub struct InProgressRegistry {
    in_progress: RwLock<HashSet<String>>,
    last_exec: RwLock<HashMap<String, i64>>,
}

impl InProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pair for this tick. Returns false when the pair already has
    /// an active upload.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut guard = match self.in_progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(key.to_string())
    }

    /// Release a pair after its batch drained or the tick produced no work
    pub fn release(&self, key: &str) {
        let mut guard = match self.in_progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(key);
    }

    pub fn is_in_progress(&self, key: &str) -> bool {
        let guard = match self.in_progress.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.contains(key)
    }

    /// Number of pairs currently holding an upload
    pub fn in_progress_count(&self) -> usize {
        let guard = match self.in_progress.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.len()
    }

    /// Record that a pair started an upload run now (before the run, not
    /// after it)
    pub fn record_last_exec(&self, key: &str, unix_seconds: i64) {
        let mut guard = match self.last_exec.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(key.to_string(), unix_seconds);
    }

    pub fn last_exec(&self, key: &str) -> Option<i64> {
        let guard = match self.last_exec.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(key).copied()
    }
}

/// Pairs known to have been interrupted mid-export at process startup.
///
/// Keyed by the full (source_id, destination_id) pair so a destination
/// serving multiple sources recovers each binding independently.
#[derive(Debug, Default)]
pub struct RecoverySet {
    pairs: RwLock<HashSet<(String, String)>>,
}

impl RecoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source_id: &str, destination_id: &str) {
        let mut guard = match self.pairs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert((source_id.to_string(), destination_id.to_string()));
    }

    pub fn contains(&self, source_id: &str, destination_id: &str) -> bool {
        let guard = match self.pairs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.contains(&(source_id.to_string(), destination_id.to_string()))
    }

    /// Drop a pair once crash recovery succeeded
    pub fn remove(&self, source_id: &str, destination_id: &str) {
        let mut guard = match self.pairs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&(source_id.to_string(), destination_id.to_string()));
    }

    pub fn len(&self) -> usize {
        let guard = match self.pairs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive() {
        let registry = InProgressRegistry::new();

        assert!(registry.try_acquire("source:s1:destination:d1"));
        assert!(!registry.try_acquire("source:s1:destination:d1"));
        assert!(registry.try_acquire("source:s2:destination:d1"));

        assert!(registry.is_in_progress("source:s1:destination:d1"));
        assert_eq!(registry.in_progress_count(), 2);
    }

    #[test]
    fn test_release_allows_reacquire() {
        let registry = InProgressRegistry::new();
        let key = "source:s1:destination:d1";

        assert!(registry.try_acquire(key));
        registry.release(key);
        assert!(!registry.is_in_progress(key));
        assert!(registry.try_acquire(key));
    }

    #[test]
    fn test_last_exec_round_trip() {
        let registry = InProgressRegistry::new();
        let key = "source:s1:destination:d1";

        assert_eq!(registry.last_exec(key), None);
        registry.record_last_exec(key, 1_700_000_000);
        assert_eq!(registry.last_exec(key), Some(1_700_000_000));

        registry.record_last_exec(key, 1_700_000_060);
        assert_eq!(registry.last_exec(key), Some(1_700_000_060));
    }

    #[test]
    fn test_recovery_set_tracks_pairs_independently() {
        let set = RecoverySet::new();

        set.insert("s1", "d1");
        set.insert("s2", "d1");
        assert_eq!(set.len(), 2);

        set.remove("s1", "d1");
        assert!(!set.contains("s1", "d1"));
        assert!(set.contains("s2", "d1"));
    }
}
