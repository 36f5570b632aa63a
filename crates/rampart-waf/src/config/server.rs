//! Listener and TLS configuration.

use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_PORT: u16 = 3030;
pub const DEFAULT_HTTPS_PORT: u16 = 3443;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub http_enabled: bool,
    #[serde(default)]
    pub https_enabled: bool,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_file: Option<String>,
    /// Generate a self-signed certificate when none is configured.
    #[serde(default)]
    pub tls_auto_generate: bool,
    /// Gate for the `X-Next-Upstream` override header. Off by default:
    /// letting clients pick the upstream is a footgun outside trusted
    /// edges.
    #[serde(default)]
    pub trust_upstream_override: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            https_enabled: false,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            tls_cert_file: None,
            tls_key_file: None,
            tls_auto_generate: false,
            trust_upstream_override: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_https_port() -> u16 {
    DEFAULT_HTTPS_PORT
}
