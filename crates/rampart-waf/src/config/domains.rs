//! Per-domain routing and evaluation configuration.

use crate::rules::DomainEvalConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_WAF_THRESHOLD: i32 = 5;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainConfig {
    /// Where this domain's traffic goes, e.g. `http://127.0.0.1:9000/`.
    pub default_upstream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_host_header: Option<String>,
    #[serde(default)]
    pub preserve_original_host: bool,
    #[serde(default = "default_true")]
    pub verify_upstream_tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default)]
    pub letsencrypt: LetsEncryptConfig,
    #[serde(default = "default_threshold")]
    pub waf_threshold: i32,
    #[serde(default)]
    pub rule_filter: RuleFilterConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LetsEncryptConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Non-empty `enabled_ids` means only those rules run; otherwise every
/// rule not in `disabled_ids` runs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleFilterConfig {
    #[serde(default)]
    pub enabled_ids: Vec<u32>,
    #[serde(default)]
    pub disabled_ids: Vec<u32>,
}

impl DomainConfig {
    /// Evaluation settings for this domain.
    pub fn eval_config(&self) -> DomainEvalConfig {
        DomainEvalConfig {
            threshold: self.waf_threshold,
            enabled_ids: self.rule_filter.enabled_ids.iter().copied().collect(),
            disabled_ids: self.rule_filter.disabled_ids.iter().copied().collect(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> i32 {
    DEFAULT_WAF_THRESHOLD
}
