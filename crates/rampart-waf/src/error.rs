//! Error types for the WAF core.
//!
//! Policy denials (IP/geo/rule/rate-limit) are modeled as errors so the
//! pipeline can map each kind to its user-visible response in one place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WafError {
    /// Invalid YAML or schema violation in the main config file. The
    /// previous config snapshot is retained by the caller.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// A single rule failed to parse or compile. The loader skips the rule
    /// and continues; this kind never aborts a load.
    #[error("rule parse error in {file}: {reason}")]
    RuleParse { file: String, reason: String },

    /// Connection acquisition timed out. The caller falls back to opening a
    /// fresh connection.
    #[error("connection pool exhausted for {key}")]
    PoolExhausted { key: String },

    /// TCP connect or TLS handshake to the upstream failed.
    #[error("upstream connect error: {0}")]
    UpstreamConnect(String),

    /// I/O error while talking to an established upstream connection.
    #[error("upstream i/o error: {0}")]
    UpstreamIo(String),

    /// The rate limiter denied the request.
    #[error("rate limit exceeded for {key}")]
    RateLimitExceeded { key: String },

    /// The IP filter denied the request.
    #[error("ip {ip} blocked ({source_label})")]
    IpBlocked { ip: String, source_label: &'static str },

    /// The GeoIP gate denied the request.
    #[error("country {country} blocked for {ip}")]
    GeoBlocked { ip: String, country: String },

    /// The rule evaluator decided to block in enforce mode.
    #[error("blocked by rule {rule_id}: {message}")]
    RuleBlock { rule_id: u32, message: String },

    /// The bounded log queue was full; the message was dropped.
    #[error("log queue full")]
    LogQueueFull,

    /// A per-module memory budget would be exceeded and eviction could not
    /// make room. The caller degrades (e.g. skips caching).
    #[error("memory limit exceeded for module {module}")]
    MemoryLimitExceeded { module: &'static str },

    /// A supervised task crashed.
    #[error("task {name} crashed: {reason}")]
    TaskCrash { name: String, reason: String },
}

impl WafError {
    /// HTTP status code for policy-denial kinds; `None` for internal kinds
    /// that never map directly to a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            WafError::IpBlocked { .. } | WafError::GeoBlocked { .. } => Some(403),
            WafError::RuleBlock { .. } => Some(403),
            WafError::RateLimitExceeded { .. } => Some(429),
            WafError::UpstreamConnect(_) | WafError::UpstreamIo(_) => Some(502),
            _ => None,
        }
    }
}
