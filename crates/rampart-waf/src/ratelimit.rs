//! Sharded sliding-window rate limiting.
//!
//! Keys are `"{ip}:{endpoint_pattern_or_default}"`, hashed over 64 shards
//! with one mutex each, so distinct IPs effectively never contend. The
//! background eviction pass is wall-clock budgeted at 2 ms; it parks its
//! shard cursor on timeout and resumes there next cycle.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const SHARD_COUNT: usize = 64;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const EVICTION_BUDGET: Duration = Duration::from_millis(2);

/// An ordered endpoint override: the first matching glob wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLimit {
    /// Path glob; `*` is the only wildcard and matches across segments.
    pub pattern: String,
    pub limit: u32,
    pub window_secs: u64,
}

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_limit: u32,
    pub default_window_secs: u64,
    pub endpoints: Vec<EndpointLimit>,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: 100,
            default_window_secs: 60,
            endpoints: Vec::new(),
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

/// Outcome of a limiter check, carrying everything the response headers
/// need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the window (or explicit block) resets.
    pub reset_at: u64,
    /// Set only while an explicit block is active.
    pub blocked_until: Option<u64>,
    pub key: String,
}

#[derive(Debug)]
struct SlidingWindowCounter {
    limit: u32,
    window_ms: u64,
    /// Request instants in epoch milliseconds, oldest first.
    timestamps: Vec<u64>,
    blocked_until: Option<u64>,
}

impl SlidingWindowCounter {
    fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            timestamps: Vec::with_capacity(limit as usize),
            blocked_until: None,
        }
    }

    fn check(&mut self, now_ms: u64) -> (bool, u32, u64) {
        if let Some(until) = self.blocked_until {
            if now_ms < until {
                return (false, 0, until);
            }
            self.blocked_until = None;
        }

        let cutoff = now_ms.saturating_sub(self.window_ms);
        self.timestamps.retain(|&t| t > cutoff);

        if self.timestamps.len() >= self.limit as usize {
            let reset = self.timestamps[0] + self.window_ms;
            return (false, 0, reset);
        }

        self.timestamps.push(now_ms);
        let remaining = self.limit - self.timestamps.len() as u32;
        let reset = self.timestamps[0] + self.window_ms;
        (true, remaining, reset)
    }

    /// Evictable when no block is pending and the counter has gone quiet.
    fn is_stale(&self, now_ms: u64, max_idle_ms: u64) -> bool {
        if self.blocked_until.is_some() {
            return false;
        }
        match self.timestamps.last() {
            None => true,
            Some(&last) => now_ms.saturating_sub(last) > max_idle_ms,
        }
    }
}

struct Shard {
    counters: Mutex<HashMap<String, SlidingWindowCounter>>,
}

/// The sharded limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    shards: Vec<Shard>,
    /// Eviction resume point, advanced across budgeted passes.
    evict_cursor: AtomicUsize,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    counters: Mutex::new(HashMap::new()),
                })
                .collect(),
            evict_cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and count a request. The key's limit/window come from the
    /// first matching endpoint pattern, falling back to the defaults.
    pub fn check(&self, ip: &str, path: &str) -> RateLimitResult {
        self.check_at(ip, path, now_epoch_ms())
    }

    /// Clock-injected variant used by tests.
    pub fn check_at(&self, ip: &str, path: &str, now_ms: u64) -> RateLimitResult {
        let (pattern, limit, window_secs) = self.resolve(path);
        let key = format!("{ip}:{pattern}");

        if !self.config.enabled {
            return RateLimitResult {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: now_ms / 1000 + window_secs,
                blocked_until: None,
                key,
            };
        }

        let shard = &self.shards[shard_index(&key)];
        let mut counters = shard.counters.lock();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| SlidingWindowCounter::new(limit, window_secs * 1000));

        let (allowed, remaining, reset_ms) = counter.check(now_ms);
        let blocked_until = counter.blocked_until.map(|ms| ms.div_ceil(1000));

        RateLimitResult {
            allowed,
            limit,
            remaining,
            reset_at: reset_ms.div_ceil(1000),
            blocked_until,
            key,
        }
    }

    /// Explicitly block an IP: every counter under `"{ip}:"` gets
    /// `blocked_until = now + duration`; the default key is created when
    /// the IP has no counters yet.
    pub fn block_ip(&self, ip: &str, duration: Duration) {
        let until = now_epoch_ms() + duration.as_millis() as u64;
        let prefix = format!("{ip}:");
        let mut touched = false;

        for shard in &self.shards {
            let mut counters = shard.counters.lock();
            for (key, counter) in counters.iter_mut() {
                if key.starts_with(&prefix) {
                    counter.blocked_until = Some(until);
                    touched = true;
                }
            }
        }

        if !touched {
            let key = format!("{ip}:default");
            let shard = &self.shards[shard_index(&key)];
            let mut counters = shard.counters.lock();
            let counter = counters.entry(key).or_insert_with(|| {
                SlidingWindowCounter::new(
                    self.config.default_limit,
                    self.config.default_window_secs * 1000,
                )
            });
            counter.blocked_until = Some(until);
        }

        crate::metrics::record_ip_blocked();
        debug!(ip, ?duration, "explicit rate-limit block applied");
    }

    /// One eviction pass, capped at [`EVICTION_BUDGET`] of wall clock. On
    /// timeout the shard cursor is left where the pass stopped. Returns the
    /// number of counters removed.
    pub fn evict_stale(&self) -> usize {
        let started = Instant::now();
        let now_ms = now_epoch_ms();
        let max_idle_ms = self.config.cleanup_interval_secs * 2 * 1000;
        let mut removed = 0usize;

        let start_shard = self.evict_cursor.load(Ordering::Relaxed) % SHARD_COUNT;
        for offset in 0..SHARD_COUNT {
            if started.elapsed() >= EVICTION_BUDGET {
                self.evict_cursor
                    .store((start_shard + offset) % SHARD_COUNT, Ordering::Relaxed);
                crate::metrics::set_active_counters(self.active_counters());
                crate::metrics::record_gc_run(started.elapsed().as_secs_f64());
                debug!(removed, "eviction budget exhausted, resuming next cycle");
                return removed;
            }
            let shard = &self.shards[(start_shard + offset) % SHARD_COUNT];
            let mut counters = shard.counters.lock();
            let before = counters.len();
            counters.retain(|_, c| !c.is_stale(now_ms, max_idle_ms));
            removed += before - counters.len();
        }

        self.evict_cursor.store(start_shard, Ordering::Relaxed);
        crate::metrics::set_active_counters(self.active_counters());
        crate::metrics::record_gc_run(started.elapsed().as_secs_f64());
        removed
    }

    pub fn active_counters(&self) -> usize {
        self.shards.iter().map(|s| s.counters.lock().len()).sum()
    }

    fn resolve(&self, path: &str) -> (&str, u32, u64) {
        for ep in &self.config.endpoints {
            if glob_match(&ep.pattern, path) {
                return (ep.pattern.as_str(), ep.limit, ep.window_secs);
            }
        }
        (
            "default",
            self.config.default_limit,
            self.config.default_window_secs,
        )
    }
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Glob matching with `*` as the only wildcard, matching across segments.
fn glob_match(pattern: &str, path: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = path.chars().collect();

    // Iterative star-backtracking matcher.
    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while si < s.len() {
        if pi < p.len() && (p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = si;
            pi += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            default_limit: limit,
            default_window_secs: window_secs,
            endpoints: Vec::new(),
            cleanup_interval_secs: 300,
        })
    }

    #[test]
    fn test_limit_enforced_within_window() {
        let rl = limiter(3, 60);
        let t0 = 1_000_000;

        for i in 0..3 {
            let r = rl.check_at("1.2.3.4", "/api", t0 + i * 100);
            assert!(r.allowed, "request {i} should pass");
        }
        let r = rl.check_at("1.2.3.4", "/api", t0 + 400);
        assert!(!r.allowed);
        assert_eq!(r.remaining, 0);
    }

    #[test]
    fn test_remaining_counts_down() {
        let rl = limiter(3, 60);
        let t0 = 1_000_000;

        assert_eq!(rl.check_at("ip", "/", t0).remaining, 2);
        assert_eq!(rl.check_at("ip", "/", t0 + 1).remaining, 1);
        assert_eq!(rl.check_at("ip", "/", t0 + 2).remaining, 0);
        assert!(!rl.check_at("ip", "/", t0 + 3).allowed);
    }

    #[test]
    fn test_window_slides() {
        let rl = limiter(2, 10);
        let t0 = 1_000_000;

        assert!(rl.check_at("ip", "/", t0).allowed);
        assert!(rl.check_at("ip", "/", t0 + 1000).allowed);
        assert!(!rl.check_at("ip", "/", t0 + 2000).allowed);
        // First timestamp ages out of the 10 s window.
        assert!(rl.check_at("ip", "/", t0 + 10_500).allowed);
    }

    #[test]
    fn test_reset_at_is_oldest_plus_window() {
        let rl = limiter(2, 60);
        let t0 = 1_000_000; // epoch ms
        let r = rl.check_at("ip", "/", t0);
        assert_eq!(r.reset_at, (t0 + 60_000).div_ceil(1000));
    }

    #[test]
    fn test_distinct_ips_do_not_share_counters() {
        let rl = limiter(1, 60);
        let t0 = 1_000_000;
        assert!(rl.check_at("1.1.1.1", "/", t0).allowed);
        assert!(rl.check_at("2.2.2.2", "/", t0).allowed);
        assert!(!rl.check_at("1.1.1.1", "/", t0 + 1).allowed);
    }

    #[test]
    fn test_endpoint_pattern_overrides_default() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: true,
            default_limit: 100,
            default_window_secs: 60,
            endpoints: vec![EndpointLimit {
                pattern: "/login*".into(),
                limit: 1,
                window_secs: 60,
            }],
            cleanup_interval_secs: 300,
        });
        let t0 = 1_000_000;

        let r = rl.check_at("ip", "/login", t0);
        assert!(r.allowed);
        assert_eq!(r.limit, 1);
        assert!(r.key.ends_with(":/login*"));

        assert!(!rl.check_at("ip", "/login?u=a", t0 + 1).allowed);
        // Other paths use the roomy default.
        assert!(rl.check_at("ip", "/api", t0 + 2).allowed);
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: true,
            default_limit: 100,
            default_window_secs: 60,
            endpoints: vec![
                EndpointLimit {
                    pattern: "/api/*".into(),
                    limit: 5,
                    window_secs: 60,
                },
                EndpointLimit {
                    pattern: "/api/admin/*".into(),
                    limit: 1,
                    window_secs: 60,
                },
            ],
            cleanup_interval_secs: 300,
        });
        // Ordered list: the broader pattern listed first captures it.
        let r = rl.check_at("ip", "/api/admin/users", 1_000_000);
        assert_eq!(r.limit, 5);
    }

    #[test]
    fn test_glob_star_spans_segments() {
        assert!(glob_match("/api/*", "/api/v1/users"));
        assert!(glob_match("/api/*/users", "/api/v1/users"));
        assert!(glob_match("*", "/anything/at/all"));
        assert!(glob_match("/exact", "/exact"));
        assert!(!glob_match("/exact", "/exact/no"));
        assert!(!glob_match("/api/*", "/other"));
        assert!(glob_match("/a*c", "/abc"));
        assert!(glob_match("/a*c", "/ac"));
        assert!(!glob_match("/a*c", "/ab"));
    }

    #[test]
    fn test_block_ip_denies_until_expiry() {
        let rl = limiter(100, 60);
        let t0 = now_epoch_ms();

        // Prime a counter under the IP first.
        assert!(rl.check_at("9.9.9.9", "/", t0).allowed);
        rl.block_ip("9.9.9.9", Duration::from_secs(600));

        let r = rl.check_at("9.9.9.9", "/", t0 + 1000);
        assert!(!r.allowed);
        assert_eq!(r.remaining, 0);
        assert!(r.blocked_until.is_some());
    }

    #[test]
    fn test_block_ip_creates_default_key() {
        let rl = limiter(100, 60);
        rl.block_ip("8.8.4.4", Duration::from_secs(60));
        assert_eq!(rl.active_counters(), 1);
        assert!(!rl.check("8.8.4.4", "/anything").allowed);
    }

    #[test]
    fn test_block_expires() {
        let rl = limiter(100, 60);
        let t0 = 1_000_000;
        rl.check_at("ip", "/", t0);

        // Set a block directly via the counter path with a known clock.
        {
            let key = "ip:default".to_string();
            let shard = &rl.shards[shard_index(&key)];
            let mut counters = shard.counters.lock();
            counters.get_mut(&key).unwrap().blocked_until = Some(t0 + 5000);
        }
        assert!(!rl.check_at("ip", "/", t0 + 4000).allowed);
        // Block cleared once now >= blocked_until.
        assert!(rl.check_at("ip", "/", t0 + 5000).allowed);
    }

    #[test]
    fn test_eviction_removes_stale_counters() {
        let rl = limiter(10, 1);
        let long_ago = now_epoch_ms().saturating_sub(3_600_000);
        rl.check_at("old-client", "/", long_ago);
        rl.check_at("fresh-client", "/", now_epoch_ms());
        assert_eq!(rl.active_counters(), 2);

        let removed = rl.evict_stale();
        assert_eq!(removed, 1);
        assert_eq!(rl.active_counters(), 1);
    }

    #[test]
    fn test_eviction_spares_blocked_counters() {
        let rl = limiter(10, 1);
        let long_ago = now_epoch_ms().saturating_sub(3_600_000);
        rl.check_at("blocked-client", "/", long_ago);
        rl.block_ip("blocked-client", Duration::from_secs(7200));

        assert_eq!(rl.evict_stale(), 0);
        assert_eq!(rl.active_counters(), 1);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: false,
            default_limit: 1,
            ..Default::default()
        });
        let t0 = 1_000_000;
        for i in 0..10 {
            assert!(rl.check_at("ip", "/", t0 + i).allowed);
        }
        assert_eq!(rl.active_counters(), 0);
    }

    #[test]
    fn test_exactly_limit_requests_allowed_in_any_window() {
        // Non-increasing allowed-rate invariant: within any interval <=
        // window, at most `limit` requests pass.
        let rl = limiter(5, 30);
        let t0 = 1_000_000;
        let mut allowed = 0;
        for i in 0..50 {
            if rl.check_at("ip", "/", t0 + i * 100).allowed {
                allowed += 1;
            }
        }
        // All 50 probes fall within one 30 s window.
        assert_eq!(allowed, 5);
    }
}
