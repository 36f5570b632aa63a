//! Logging and metrics configuration sections.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for waf.log / audit.log; stdout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub enable_audit: bool,
    /// Fraction of requests that record a full trace, 0.0..=1.0.
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size_mb: default_max_size_mb(),
            retention_days: default_retention_days(),
            enable_audit: true,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_retention_days() -> u32 {
    30
}

fn default_sample_rate() -> f64 {
    1.0
}
