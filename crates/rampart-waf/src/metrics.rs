//! Prometheus metrics for the WAF.
//!
//! A fixed registry of 25 metrics in seven groups: request, backend,
//! rate-limit, connection pool, memory, rule engine, and system. Buckets
//! are fixed per metric (sub-millisecond for rule evaluation, seconds
//! scale for backend latency).

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram,
    TextEncoder,
};

lazy_static! {
    // ===== Request (5) =====

    /// Total requests seen by the pipeline
    pub static ref REQUESTS_TOTAL: Counter = register_counter!(
        "rampart_requests_total",
        "Total number of requests processed by the WAF pipeline"
    )
    .unwrap();

    /// Requests blocked by any admission stage or the rule engine
    pub static ref BLOCKED_TOTAL: Counter = register_counter!(
        "rampart_blocked_total",
        "Total number of requests blocked"
    )
    .unwrap();

    /// Requests with rule matches in observe mode or below threshold
    pub static ref OBSERVED_TOTAL: Counter = register_counter!(
        "rampart_observed_total",
        "Total number of requests observed (matched but not blocked)"
    )
    .unwrap();

    /// End-to-end request duration
    pub static ref REQUEST_DURATION_SECONDS: Histogram = register_histogram!(
        "rampart_request_duration_seconds",
        "End-to-end request duration in seconds",
        vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    /// Total request body bytes read
    pub static ref REQUEST_SIZE_BYTES_TOTAL: Counter = register_counter!(
        "rampart_request_size_bytes_total",
        "Total request body bytes read by the pipeline"
    )
    .unwrap();

    // ===== Backend (4) =====

    /// Upstream forward attempts
    pub static ref BACKEND_REQUESTS_TOTAL: Counter = register_counter!(
        "rampart_backend_requests_total",
        "Total number of requests forwarded to upstreams"
    )
    .unwrap();

    /// Upstream failures after exhausting retries
    pub static ref BACKEND_ERRORS_TOTAL: Counter = register_counter!(
        "rampart_backend_errors_total",
        "Total number of upstream requests that failed after retries"
    )
    .unwrap();

    /// Individual retry attempts
    pub static ref BACKEND_RETRIES_TOTAL: Counter = register_counter!(
        "rampart_backend_retries_total",
        "Total number of upstream retry attempts"
    )
    .unwrap();

    /// Upstream round-trip latency
    pub static ref BACKEND_LATENCY_SECONDS: Histogram = register_histogram!(
        "rampart_backend_latency_seconds",
        "Upstream round-trip latency in seconds",
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // ===== Rate limit (3) =====

    /// Requests denied by the rate limiter
    pub static ref RATE_LIMITED_TOTAL: Counter = register_counter!(
        "rampart_rate_limited_total",
        "Total number of requests denied by the rate limiter"
    )
    .unwrap();

    /// Live sliding-window counters across all shards
    pub static ref RATE_LIMIT_ACTIVE_COUNTERS: Gauge = register_gauge!(
        "rampart_rate_limit_active_counters",
        "Number of live rate-limit counters across all shards"
    )
    .unwrap();

    /// Explicit IP blocks applied
    pub static ref RATE_LIMIT_BLOCKED_IPS_TOTAL: Counter = register_counter!(
        "rampart_rate_limit_blocked_ips_total",
        "Total number of explicit IP blocks applied"
    )
    .unwrap();

    // ===== Connection pool (4) =====

    /// Connections owned across all pools
    pub static ref POOL_SIZE: Gauge = register_gauge!(
        "rampart_pool_size",
        "Total connections owned across all upstream pools"
    )
    .unwrap();

    /// Idle connections ready for acquire
    pub static ref POOL_AVAILABLE: Gauge = register_gauge!(
        "rampart_pool_available",
        "Idle connections available across all upstream pools"
    )
    .unwrap();

    /// Successful acquires (pooled or fresh)
    pub static ref POOL_ACQUIRED_TOTAL: Counter = register_counter!(
        "rampart_pool_acquired_total",
        "Total connection acquisitions"
    )
    .unwrap();

    /// Acquire timeouts that fell back to a fresh connection
    pub static ref POOL_TIMEOUTS_TOTAL: Counter = register_counter!(
        "rampart_pool_timeouts_total",
        "Total connection acquire timeouts"
    )
    .unwrap();

    // ===== Memory (3) =====

    /// Tracked bytes across all modules
    pub static ref MEMORY_USAGE_BYTES: Gauge = register_gauge!(
        "rampart_memory_usage_bytes",
        "Bytes currently tracked across all memory modules"
    )
    .unwrap();

    /// Degradation/eviction sweeps triggered by memory pressure
    pub static ref MEMORY_GC_RUNS_TOTAL: Counter = register_counter!(
        "rampart_memory_gc_runs_total",
        "Total eviction sweeps triggered by memory pressure"
    )
    .unwrap();

    /// Duration of eviction sweeps
    pub static ref MEMORY_GC_DURATION_SECONDS: Histogram = register_histogram!(
        "rampart_memory_gc_duration_seconds",
        "Duration of memory eviction sweeps in seconds",
        vec![0.0001, 0.00025, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.05]
    )
    .unwrap();

    // ===== Rule engine (3) =====

    /// Rules in the active snapshot
    pub static ref RULES_LOADED: Gauge = register_gauge!(
        "rampart_rules_loaded",
        "Number of rules in the active snapshot"
    )
    .unwrap();

    /// Per-request rule evaluation time (sub-millisecond buckets)
    pub static ref RULE_EVALUATION_SECONDS: Histogram = register_histogram!(
        "rampart_rule_evaluation_seconds",
        "Rule evaluation duration in seconds",
        vec![0.00001, 0.000025, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01]
    )
    .unwrap();

    /// Version of the active snapshot
    pub static ref SNAPSHOT_VERSION: Gauge = register_gauge!(
        "rampart_rule_snapshot_version",
        "Version of the active rule snapshot"
    )
    .unwrap();

    // ===== System (3) =====

    /// Seconds since process start
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "rampart_uptime_seconds",
        "Seconds since the process started"
    )
    .unwrap();

    /// Supervised task crashes
    pub static ref FIBER_CRASHES_TOTAL: Counter = register_counter!(
        "rampart_fiber_crashes_total",
        "Total crashes of supervised tasks"
    )
    .unwrap();

    /// Config and rule reloads applied
    pub static ref CONFIG_RELOADS_TOTAL: Counter = register_counter!(
        "rampart_config_reloads_total",
        "Total configuration and rule reloads applied"
    )
    .unwrap();
}

/// Collect all metrics in Prometheus text exposition format (0.0.4).
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Content type for the `/metrics` endpoint.
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

pub fn record_request(duration_secs: f64, body_bytes: usize) {
    REQUESTS_TOTAL.inc();
    REQUEST_DURATION_SECONDS.observe(duration_secs);
    REQUEST_SIZE_BYTES_TOTAL.inc_by(body_bytes as f64);
}

pub fn record_blocked() {
    BLOCKED_TOTAL.inc();
}

pub fn record_observed() {
    OBSERVED_TOTAL.inc();
}

pub fn record_backend_request(latency_secs: f64) {
    BACKEND_REQUESTS_TOTAL.inc();
    BACKEND_LATENCY_SECONDS.observe(latency_secs);
}

pub fn record_backend_error() {
    BACKEND_ERRORS_TOTAL.inc();
}

pub fn record_backend_retry() {
    BACKEND_RETRIES_TOTAL.inc();
}

pub fn record_rate_limited() {
    RATE_LIMITED_TOTAL.inc();
}

pub fn set_active_counters(count: usize) {
    RATE_LIMIT_ACTIVE_COUNTERS.set(count as f64);
}

pub fn record_ip_blocked() {
    RATE_LIMIT_BLOCKED_IPS_TOTAL.inc();
}

pub fn set_pool_gauges(size: usize, available: usize) {
    POOL_SIZE.set(size as f64);
    POOL_AVAILABLE.set(available as f64);
}

pub fn record_pool_acquire() {
    POOL_ACQUIRED_TOTAL.inc();
}

pub fn record_pool_timeout() {
    POOL_TIMEOUTS_TOTAL.inc();
}

pub fn set_memory_usage(bytes: usize) {
    MEMORY_USAGE_BYTES.set(bytes as f64);
}

pub fn record_gc_run(duration_secs: f64) {
    MEMORY_GC_RUNS_TOTAL.inc();
    MEMORY_GC_DURATION_SECONDS.observe(duration_secs);
}

pub fn set_rules_loaded(count: usize, version: i64) {
    RULES_LOADED.set(count as f64);
    SNAPSHOT_VERSION.set(version as f64);
}

pub fn observe_rule_evaluation(duration_secs: f64) {
    RULE_EVALUATION_SECONDS.observe(duration_secs);
}

pub fn set_uptime(secs: f64) {
    UPTIME_SECONDS.set(secs);
}

pub fn record_fiber_crash() {
    FIBER_CRASHES_TOTAL.inc();
}

pub fn record_config_reload() {
    CONFIG_RELOADS_TOTAL.inc();
}
