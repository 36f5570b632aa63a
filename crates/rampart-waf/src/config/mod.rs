//! Configuration types for the WAF.
//!
//! The YAML file carries a `waf:` root with the sections below; recognized
//! environment variables override individual fields after parsing. The
//! loader keeps the file's mtime so `check_and_reload` is a single stat on
//! the no-change path, and a parse failure always retains the previous
//! config.

mod domains;
mod logging;
mod pool;
mod security;
mod server;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

pub use domains::{DomainConfig, LetsEncryptConfig, RuleFilterConfig, DEFAULT_WAF_THRESHOLD};
pub use logging::{LoggingConfig, MetricsConfig};
pub use pool::ConnectionPoolingConfig;
pub use security::{EndpointLimitConfig, GeoIpConfig, IpFilteringConfig, RateLimitingConfig};
pub use server::{ServerConfig, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 5;
pub const CONFIG_FILE_ENV: &str = "WAF_CONFIG_FILE";

/// Enforce blocks on matching deny rules; observe only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WafMode {
    Enforce,
    Observe,
}

impl Default for WafMode {
    fn default() -> Self {
        WafMode::Enforce
    }
}

/// The `waf:` file root.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WafFileConfig {
    #[serde(default)]
    pub waf: WafConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WafConfig {
    #[serde(default)]
    pub mode: WafMode,

    /// Global default upstream, used when no domain matches a request and
    /// no per-domain upstream applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_host_header: Option<String>,
    #[serde(default)]
    pub preserve_original_host: bool,

    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub ip_filtering: IpFilteringConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub connection_pooling: ConnectionPoolingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            mode: WafMode::Enforce,
            upstream: None,
            upstream_host_header: None,
            preserve_original_host: false,
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            reload_interval_secs: DEFAULT_RELOAD_INTERVAL_SECS,
            domains: HashMap::new(),
            rate_limiting: RateLimitingConfig::default(),
            ip_filtering: IpFilteringConfig::default(),
            geoip: GeoIpConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            connection_pooling: ConnectionPoolingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RulesConfig {
    #[serde(default = "default_rule_dir")]
    pub dir: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: default_rule_dir(),
        }
    }
}

fn default_rule_dir() -> String {
    "rules".to_string()
}

fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

fn default_reload_interval() -> u64 {
    DEFAULT_RELOAD_INTERVAL_SECS
}

impl WafConfig {
    /// Parse the YAML file, apply environment overrides, and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(&path)?;
        let file: WafFileConfig = serde_yaml::from_str(&contents)?;
        let mut config = file.waf;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn observe_mode(&self) -> bool {
        self.mode == WafMode::Observe
    }

    /// Domain lookup by normalized host (lowercase, port stripped).
    pub fn domain(&self, host: &str) -> Option<&DomainConfig> {
        self.domains.get(host)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.server.http_enabled && !self.server.https_enabled {
            anyhow::bail!("at least one of server.http_enabled / server.https_enabled must be set");
        }
        if self.server.https_enabled
            && !self.server.tls_auto_generate
            && (self.server.tls_cert_file.is_none() || self.server.tls_key_file.is_none())
        {
            anyhow::bail!(
                "https listener requires server.tls_cert_file and server.tls_key_file \
                 (or server.tls_auto_generate)"
            );
        }
        if self.body_limit_bytes == 0 {
            anyhow::bail!("body_limit_bytes must be positive");
        }
        for (name, domain) in &self.domains {
            if domain.default_upstream.is_empty() {
                anyhow::bail!("domain '{name}' has an empty default_upstream");
            }
        }
        Ok(())
    }

    /// Apply the recognized environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_str("RULE_DIR") {
            self.rules.dir = v;
        }
        if let Some(v) = env_str("UPSTREAM") {
            self.upstream = Some(v);
        }
        if let Some(v) = env_str("UPSTREAM_HOST_HEADER") {
            self.upstream_host_header = Some(v);
        }
        if let Some(v) = env_bool("PRESERVE_ORIGINAL_HOST") {
            self.preserve_original_host = v;
        }
        if let Some(v) = env_bool("OBSERVE") {
            self.mode = if v { WafMode::Observe } else { WafMode::Enforce };
        }
        if let Some(v) = env_parse::<usize>("BODY_LIMIT_BYTES") {
            self.body_limit_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("RELOAD_INTERVAL_SEC") {
            self.reload_interval_secs = v;
        }

        if let Some(v) = env_str("LOG_DIR") {
            self.logging.dir = Some(v);
        }
        if let Some(v) = env_parse::<u64>("LOG_MAX_SIZE_MB") {
            self.logging.max_size_mb = v;
        }
        if let Some(v) = env_parse::<u32>("LOG_RETENTION_DAYS") {
            self.logging.retention_days = v;
        }
        if let Some(v) = env_bool("LOG_ENABLE_AUDIT") {
            self.logging.enable_audit = v;
        }

        if let Some(v) = env_bool("RATE_LIMIT_ENABLED") {
            self.rate_limiting.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_DEFAULT_LIMIT") {
            self.rate_limiting.default_limit = v;
        }
        if let Some(v) = env_parse::<u64>("RATE_LIMIT_WINDOW_SEC") {
            self.rate_limiting.default_window_secs = v;
        }
        if let Some(v) = env_parse::<u64>("RATE_LIMIT_CLEANUP_INTERVAL_SEC") {
            self.rate_limiting.cleanup_interval_secs = v;
        }

        if let Some(v) = env_bool("IP_FILTER_ENABLED") {
            self.ip_filtering.enabled = v;
        }
        if let Some(v) = env_str("IP_WHITELIST_FILE") {
            self.ip_filtering.whitelist_file = Some(v);
        }
        if let Some(v) = env_str("IP_BLACKLIST_FILE") {
            self.ip_filtering.blacklist_file = Some(v);
        }

        if let Some(v) = env_bool("GEOIP_ENABLED") {
            self.geoip.enabled = v;
        }
        if let Some(v) = env_str("GEOIP_DB_PATH") {
            self.geoip.db_path = Some(v);
        }
        if let Some(v) = env_str("GEOIP_ALLOWED_COUNTRIES") {
            self.geoip.allowed_countries = split_csv(&v);
        }
        if let Some(v) = env_str("GEOIP_BLOCKED_COUNTRIES") {
            self.geoip.blocked_countries = split_csv(&v);
        }

        if let Some(v) = env_bool("HTTP_ENABLED") {
            self.server.http_enabled = v;
        }
        if let Some(v) = env_bool("HTTPS_ENABLED") {
            self.server.https_enabled = v;
        }
        if let Some(v) = env_parse::<u16>("HTTP_PORT") {
            self.server.http_port = v;
        }
        if let Some(v) = env_parse::<u16>("HTTPS_PORT") {
            self.server.https_port = v;
        }
        if let Some(v) = env_str("TLS_CERT_FILE") {
            self.server.tls_cert_file = Some(v);
        }
        if let Some(v) = env_str("TLS_KEY_FILE") {
            self.server.tls_key_file = Some(v);
        }
        if let Some(v) = env_bool("TLS_AUTO_GENERATE") {
            self.server.tls_auto_generate = v;
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Tracks the config file's mtime and reloads it on change, retaining the
/// previous config when the new file fails to parse.
pub struct ConfigLoader {
    path: Option<PathBuf>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            last_mtime: Mutex::new(None),
        }
    }

    pub fn load(&self) -> Result<WafConfig, anyhow::Error> {
        match &self.path {
            Some(path) => {
                let config = WafConfig::from_file(path)?;
                *self.last_mtime.lock() = file_mtime(path);
                Ok(config)
            }
            None => WafConfig::from_env(),
        }
    }

    /// Returns the new config when the file changed and parses cleanly.
    /// A changed-but-broken file logs and returns `None` (previous config
    /// stays in effect); the mtime is still recorded so the same broken
    /// file is not re-parsed every tick.
    pub fn check_and_reload(&self) -> Option<WafConfig> {
        let path = self.path.as_ref()?;
        let current = file_mtime(path);
        {
            let mut last = self.last_mtime.lock();
            if current == *last {
                return None;
            }
            *last = current;
        }

        match WafConfig::from_file(path) {
            Ok(config) => {
                info!(file = %path.display(), "configuration reloaded");
                Some(config)
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "config reload failed, keeping previous config");
                None
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
