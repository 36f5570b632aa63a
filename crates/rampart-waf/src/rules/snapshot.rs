//! Immutable rule snapshots and the atomic holder.
//!
//! A snapshot is frozen at construction; reload publishes a whole new
//! snapshot through [`SnapshotHolder::swap`]. Readers clone the inner `Arc`
//! under a short read guard and keep evaluating against that snapshot even
//! if a swap lands mid-request; the old snapshot drops when its last reader
//! releases the `Arc`.

use super::model::Rule;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// An immutable view of the loaded rule set.
#[derive(Debug)]
pub struct RuleSnapshot {
    /// Evaluation order: rule-insertion order within a file, files sorted
    /// by path so the order is stable across no-change reloads.
    pub rules: Vec<Arc<Rule>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    /// Content hash per source file, used by the loader's change check.
    pub file_checksums: HashMap<PathBuf, u64>,
}

impl RuleSnapshot {
    /// An empty version-0 snapshot, installed before the first load.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            version: 0,
            created_at: Utc::now(),
            file_checksums: HashMap::new(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Shared holder for the current snapshot.
///
/// Reads take a short `RwLock` read guard to clone the `Arc`; swaps are
/// serialized by a dedicated writer mutex so concurrent reloaders cannot
/// interleave version assignment.
pub struct SnapshotHolder {
    current: RwLock<Arc<RuleSnapshot>>,
    writer: Mutex<()>,
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSnapshot::empty())),
            writer: Mutex::new(()),
        }
    }

    /// The current snapshot. Cheap: one Arc clone.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Install `build`'s result as the next snapshot. The builder receives
    /// the version it must use (`previous + 1`); the holder enforces the
    /// strictly-increasing invariant by assigning versions itself.
    pub fn swap_with<F>(&self, build: F) -> Arc<RuleSnapshot>
    where
        F: FnOnce(i64) -> RuleSnapshot,
    {
        let _writer = self.writer.lock();
        let next_version = self.current.read().version + 1;
        let mut snapshot = build(next_version);
        snapshot.version = next_version;
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Arc::clone(&snapshot);
        snapshot
    }
}

impl Default for SnapshotHolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_version(v: i64) -> RuleSnapshot {
        RuleSnapshot {
            rules: Vec::new(),
            version: v,
            created_at: Utc::now(),
            file_checksums: HashMap::new(),
        }
    }

    #[test]
    fn test_initial_snapshot_is_empty_version_zero() {
        let holder = SnapshotHolder::new();
        let snap = holder.current();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.rule_count(), 0);
    }

    #[test]
    fn test_swap_increments_version_by_one() {
        let holder = SnapshotHolder::new();
        let s1 = holder.swap_with(snapshot_with_version);
        assert_eq!(s1.version, 1);
        let s2 = holder.swap_with(snapshot_with_version);
        assert_eq!(s2.version, 2);
        assert_eq!(holder.current().version, 2);
    }

    #[test]
    fn test_holder_overrides_builder_version() {
        let holder = SnapshotHolder::new();
        // A builder that lies about the version is corrected.
        let s = holder.swap_with(|_| snapshot_with_version(999));
        assert_eq!(s.version, 1);
    }

    #[test]
    fn test_reader_keeps_old_snapshot_across_swap() {
        let holder = SnapshotHolder::new();
        holder.swap_with(snapshot_with_version);
        let held = holder.current();
        holder.swap_with(snapshot_with_version);
        // The reader's snapshot is unaffected by the swap.
        assert_eq!(held.version, 1);
        assert_eq!(holder.current().version, 2);
    }

    #[test]
    fn test_concurrent_swaps_stay_strictly_increasing() {
        let holder = Arc::new(SnapshotHolder::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = Arc::clone(&holder);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    h.swap_with(snapshot_with_version);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(holder.current().version, 8 * 50);
    }
}
