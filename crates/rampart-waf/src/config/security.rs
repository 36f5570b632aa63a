//! Rate-limiting, IP-filtering, and GeoIP configuration sections.

use crate::ratelimit::{EndpointLimit, RateLimitConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_window")]
    pub default_window_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointLimitConfig>,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EndpointLimitConfig {
    pub pattern: String,
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_limit(),
            default_window_secs: default_window(),
            endpoints: Vec::new(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn to_limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.enabled,
            default_limit: self.default_limit,
            default_window_secs: self.default_window_secs,
            endpoints: self
                .endpoints
                .iter()
                .map(|e| EndpointLimit {
                    pattern: e.pattern.clone(),
                    limit: e.limit,
                    window_secs: e.window_secs,
                })
                .collect(),
            cleanup_interval_secs: self.cleanup_interval_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct IpFilteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u32 {
    100
}

fn default_window() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}
