//! Per-subsystem memory budgets and bounded containers.
//!
//! Every cache-like subsystem charges its allocations to a [`MemoryModule`]
//! on the process-wide [`MemoryTracker`]. When a new allocation would push a
//! module past its cap, the module's degradation callback (typically an
//! eviction sweep) runs once; if the retry still does not fit, the
//! allocation is refused and the caller degrades.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const MIB: usize = 1024 * 1024;

/// Closed set of budgeted subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryModule {
    RateLimiter,
    ChallengeCache,
    RuleEngine,
    ConnectionPool,
    GeoIp,
    Other,
}

impl MemoryModule {
    pub const ALL: [MemoryModule; 6] = [
        MemoryModule::RateLimiter,
        MemoryModule::ChallengeCache,
        MemoryModule::RuleEngine,
        MemoryModule::ConnectionPool,
        MemoryModule::GeoIp,
        MemoryModule::Other,
    ];

    /// Byte cap for the module; `None` means unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            MemoryModule::RateLimiter => Some(50 * MIB),
            MemoryModule::ChallengeCache => Some(20 * MIB),
            MemoryModule::RuleEngine => Some(5 * MIB),
            MemoryModule::ConnectionPool => Some(10 * MIB),
            MemoryModule::GeoIp => Some(80 * MIB),
            MemoryModule::Other => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MemoryModule::RateLimiter => "rate_limiter",
            MemoryModule::ChallengeCache => "challenge_cache",
            MemoryModule::RuleEngine => "rule_engine",
            MemoryModule::ConnectionPool => "connection_pool",
            MemoryModule::GeoIp => "geoip",
            MemoryModule::Other => "other",
        }
    }

    fn index(&self) -> usize {
        match self {
            MemoryModule::RateLimiter => 0,
            MemoryModule::ChallengeCache => 1,
            MemoryModule::RuleEngine => 2,
            MemoryModule::ConnectionPool => 3,
            MemoryModule::GeoIp => 4,
            MemoryModule::Other => 5,
        }
    }
}

type DegradationCallback = Box<dyn Fn() + Send + Sync>;

struct ModuleState {
    usage: AtomicUsize,
    callback: RwLock<Option<DegradationCallback>>,
}

/// Process-wide byte accounting per module.
pub struct MemoryTracker {
    modules: [ModuleState; 6],
    gc_runs: AtomicU64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            modules: std::array::from_fn(|_| ModuleState {
                usage: AtomicUsize::new(0),
                callback: RwLock::new(None),
            }),
            gc_runs: AtomicU64::new(0),
        }
    }

    /// Register a degradation callback invoked when an allocation would
    /// exceed the module cap. Replaces any previous callback.
    pub fn set_degradation_callback<F>(&self, module: MemoryModule, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.modules[module.index()].callback.write() = Some(Box::new(callback));
    }

    /// Try to charge `bytes` to the module. Returns false (without mutating
    /// the counter) when the cap would be exceeded even after the
    /// degradation callback has had one chance to evict.
    pub fn try_allocate(&self, module: MemoryModule, bytes: usize) -> bool {
        if self.try_allocate_inner(module, bytes) {
            return true;
        }

        // One eviction attempt, then retry once.
        let state = &self.modules[module.index()];
        let ran = {
            let guard = state.callback.read();
            if let Some(cb) = guard.as_ref() {
                cb();
                true
            } else {
                false
            }
        };
        if ran {
            self.gc_runs.fetch_add(1, Ordering::Relaxed);
            return self.try_allocate_inner(module, bytes);
        }
        false
    }

    fn try_allocate_inner(&self, module: MemoryModule, bytes: usize) -> bool {
        let state = &self.modules[module.index()];
        let limit = match module.limit() {
            Some(l) => l,
            None => {
                state.usage.fetch_add(bytes, Ordering::Relaxed);
                return true;
            }
        };

        let mut current = state.usage.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= limit => n,
                _ => return false,
            };
            match state.usage.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release previously charged bytes. Saturates at zero.
    pub fn free(&self, module: MemoryModule, bytes: usize) {
        let state = &self.modules[module.index()];
        let mut current = state.usage.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match state.usage.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn usage(&self, module: MemoryModule) -> usize {
        self.modules[module.index()].usage.load(Ordering::Relaxed)
    }

    pub fn total_usage(&self) -> usize {
        MemoryModule::ALL.iter().map(|m| self.usage(*m)).sum()
    }

    pub fn gc_runs(&self) -> u64 {
        self.gc_runs.load(Ordering::Relaxed)
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct CacheEntry<V> {
    value: V,
    bytes: usize,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// A byte-budgeted map with LRU eviction, charging the memory tracker.
///
/// Used by the GeoIP cache and the ACME challenge cache. Entries carry their
/// own byte estimate; inserts that cannot fit even after evicting the oldest
/// entries are refused.
pub struct BoundedLruCache<K, V> {
    module: MemoryModule,
    tracker: Arc<MemoryTracker>,
    max_entries: usize,
    inner: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> BoundedLruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(module: MemoryModule, tracker: Arc<MemoryTracker>, max_entries: usize) -> Self {
        Self {
            module,
            tracker,
            max_entries,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert, evicting least-recently-used entries until the tracker
    /// accepts the charge. Returns false when the value cannot fit at all.
    pub fn insert(&self, key: K, value: V, bytes: usize) -> bool {
        let mut map = self.inner.lock();

        if let Some(old) = map.remove(&key) {
            self.tracker.free(self.module, old.bytes);
        }

        while map.len() >= self.max_entries || !self.tracker.try_allocate(self.module, bytes) {
            let lru = map
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            match lru {
                Some(k) => {
                    if let Some(evicted) = map.remove(&k) {
                        self.tracker.free(self.module, evicted.bytes);
                    }
                }
                None => return false, // empty and still over budget
            }
        }

        let now = Instant::now();
        map.insert(
            key,
            CacheEntry {
                value,
                bytes,
                inserted_at: now,
                last_accessed: now,
            },
        );
        true
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.inner.lock();
        map.get_mut(key).map(|e| {
            e.last_accessed = Instant::now();
            e.value.clone()
        })
    }

    /// Remove entries older than `max_age`. Returns the number removed.
    pub fn evict_older_than(&self, max_age: std::time::Duration) -> usize {
        let mut map = self.inner.lock();
        let before = map.len();
        let mut freed = 0usize;
        map.retain(|_, e| {
            if e.inserted_at.elapsed() > max_age {
                freed += e.bytes;
                false
            } else {
                true
            }
        });
        if freed > 0 {
            self.tracker.free(self.module, freed);
            debug!(
                module = self.module.name(),
                freed_bytes = freed,
                "cache sweep evicted stale entries"
            );
        }
        before - map.len()
    }

    pub fn clear(&self) {
        let mut map = self.inner.lock();
        let freed: usize = map.values().map(|e| e.bytes).sum();
        map.clear();
        if freed > 0 {
            self.tracker.free(self.module, freed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_allocate_and_free() {
        let tracker = MemoryTracker::new();
        assert!(tracker.try_allocate(MemoryModule::RuleEngine, 1024));
        assert_eq!(tracker.usage(MemoryModule::RuleEngine), 1024);
        tracker.free(MemoryModule::RuleEngine, 1024);
        assert_eq!(tracker.usage(MemoryModule::RuleEngine), 0);
    }

    #[test]
    fn test_allocate_refused_at_limit() {
        let tracker = MemoryTracker::new();
        // RuleEngine cap is 5 MiB
        assert!(tracker.try_allocate(MemoryModule::RuleEngine, 5 * MIB));
        assert!(!tracker.try_allocate(MemoryModule::RuleEngine, 1));
        // Refused allocation must not mutate the counter
        assert_eq!(tracker.usage(MemoryModule::RuleEngine), 5 * MIB);
    }

    #[test]
    fn test_other_module_is_unbounded() {
        let tracker = MemoryTracker::new();
        assert!(tracker.try_allocate(MemoryModule::Other, 500 * MIB));
        assert_eq!(tracker.usage(MemoryModule::Other), 500 * MIB);
    }

    #[test]
    fn test_free_saturates_at_zero() {
        let tracker = MemoryTracker::new();
        tracker.free(MemoryModule::GeoIp, 4096);
        assert_eq!(tracker.usage(MemoryModule::GeoIp), 0);
    }

    #[test]
    fn test_degradation_callback_invoked() {
        let tracker = Arc::new(MemoryTracker::new());
        let called = Arc::new(AtomicBool::new(false));

        let t = Arc::clone(&tracker);
        let c = Arc::clone(&called);
        tracker.set_degradation_callback(MemoryModule::ChallengeCache, move || {
            c.store(true, Ordering::SeqCst);
            // Evict everything so the retry fits.
            t.free(MemoryModule::ChallengeCache, 20 * MIB);
        });

        assert!(tracker.try_allocate(MemoryModule::ChallengeCache, 20 * MIB));
        // The second allocation triggers the callback, which frees the
        // first charge, and then succeeds on retry.
        assert!(tracker.try_allocate(MemoryModule::ChallengeCache, MIB));
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(tracker.gc_runs(), 1);
    }

    #[test]
    fn test_usage_never_exceeds_limit() {
        let tracker = MemoryTracker::new();
        for _ in 0..100 {
            let _ = tracker.try_allocate(MemoryModule::ConnectionPool, MIB);
        }
        assert!(tracker.usage(MemoryModule::ConnectionPool) <= 10 * MIB);
    }

    #[test]
    fn test_lru_cache_insert_get() {
        let tracker = Arc::new(MemoryTracker::new());
        let cache: BoundedLruCache<String, String> =
            BoundedLruCache::new(MemoryModule::GeoIp, Arc::clone(&tracker), 100);

        assert!(cache.insert("1.2.3.4".into(), "US".into(), 64));
        assert_eq!(cache.get(&"1.2.3.4".to_string()), Some("US".to_string()));
        assert_eq!(cache.get(&"5.6.7.8".to_string()), None);
        assert_eq!(tracker.usage(MemoryModule::GeoIp), 64);
    }

    #[test]
    fn test_lru_cache_entry_cap_evicts_oldest() {
        let tracker = Arc::new(MemoryTracker::new());
        let cache: BoundedLruCache<u32, u32> =
            BoundedLruCache::new(MemoryModule::GeoIp, tracker, 2);

        assert!(cache.insert(1, 10, 8));
        assert!(cache.insert(2, 20, 8));
        // Touch key 2 so key 1 is the LRU victim.
        let _ = cache.get(&2);
        assert!(cache.insert(3, 30, 8));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_lru_cache_reinsert_replaces_charge() {
        let tracker = Arc::new(MemoryTracker::new());
        let cache: BoundedLruCache<u32, u32> =
            BoundedLruCache::new(MemoryModule::GeoIp, Arc::clone(&tracker), 10);

        assert!(cache.insert(1, 10, 100));
        assert!(cache.insert(1, 11, 200));
        assert_eq!(tracker.usage(MemoryModule::GeoIp), 200);
        assert_eq!(cache.get(&1), Some(11));
    }

    #[test]
    fn test_lru_cache_clear_frees_tracker() {
        let tracker = Arc::new(MemoryTracker::new());
        let cache: BoundedLruCache<u32, u32> =
            BoundedLruCache::new(MemoryModule::ChallengeCache, Arc::clone(&tracker), 10);

        cache.insert(1, 1, 50);
        cache.insert(2, 2, 50);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(tracker.usage(MemoryModule::ChallengeCache), 0);
    }

    #[test]
    fn test_lru_cache_oversized_value_refused() {
        let tracker = Arc::new(MemoryTracker::new());
        let cache: BoundedLruCache<u32, u32> =
            BoundedLruCache::new(MemoryModule::RuleEngine, Arc::clone(&tracker), 10);

        // Larger than the 5 MiB RuleEngine cap: refused even on empty cache.
        assert!(!cache.insert(1, 1, 6 * MIB));
        assert_eq!(tracker.usage(MemoryModule::RuleEngine), 0);
    }
}
