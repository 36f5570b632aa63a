//! Process-wide runtime state.
//!
//! One [`WafRuntime`] value owns every subsystem and is threaded through
//! the pipeline; there is no global mutable state. Subsystems that a
//! graceful reload may rebuild (config, IP filter, GeoIP gate, rate
//! limiter) sit behind `RwLock<Arc<…>>` so readers swap atomically between
//! requests.

use crate::acme::ChallengeCache;
use crate::config::WafConfig;
use crate::filter::{GeoIpGate, IpFilter};
use crate::logging::{self, AuditLogger, RequestLogger};
use crate::memory::MemoryTracker;
use crate::proxy::context::TracePool;
use crate::proxy::pool::PoolManager;
use crate::ratelimit::RateLimiter;
use crate::rules::{Evaluator, RuleLoader, SnapshotHolder, SnapshotPool};
use crate::supervisor::Supervisor;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub struct WafRuntime {
    config: RwLock<Arc<WafConfig>>,
    pub snapshot_holder: Arc<SnapshotHolder>,
    pub rule_loader: Arc<RuleLoader>,
    pub evaluator: Evaluator,
    pub snapshot_pool: Arc<SnapshotPool>,
    pub trace_pool: Arc<TracePool>,
    ip_filter: RwLock<Arc<IpFilter>>,
    geoip: RwLock<Arc<GeoIpGate>>,
    rate_limiter: RwLock<Arc<RateLimiter>>,
    pub pool_manager: Arc<PoolManager>,
    pub request_logger: RequestLogger,
    pub audit_logger: Option<AuditLogger>,
    pub challenge_cache: ChallengeCache,
    pub memory_tracker: Arc<MemoryTracker>,
    pub supervisor: Arc<Supervisor>,
    pub started_at: Instant,
}

impl WafRuntime {
    /// Build every subsystem from the config and load the initial rule
    /// snapshot.
    pub fn new(config: WafConfig) -> Arc<Self> {
        let memory_tracker = Arc::new(MemoryTracker::new());

        let snapshot_holder = Arc::new(SnapshotHolder::new());
        let rule_loader = Arc::new(RuleLoader::new(
            PathBuf::from(&config.rules.dir),
            Arc::clone(&snapshot_holder),
        ));
        let snapshot = rule_loader.load();
        crate::metrics::set_rules_loaded(snapshot.rule_count(), snapshot.version);

        let snapshot_pool = SnapshotPool::new();
        let evaluator = Evaluator::new(Arc::clone(&snapshot_holder), Arc::clone(&snapshot_pool));

        let ip_filter = Arc::new(build_ip_filter(&config));
        let geoip = Arc::new(build_geoip(&config, &memory_tracker));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiting.to_limiter_config()));

        let pool_manager = PoolManager::new(
            config.connection_pooling.clone(),
            Arc::clone(&memory_tracker),
        );

        let log_dir = config.logging.dir.as_deref().map(Path::new);
        let request_logger = logging::request_logger(log_dir, config.logging.max_size_mb);
        let audit_logger = logging::audit_logger(
            log_dir,
            config.logging.max_size_mb,
            config.logging.enable_audit,
        );

        let challenge_cache = ChallengeCache::new(Arc::clone(&memory_tracker));
        let supervisor = Supervisor::new();

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            snapshot_holder,
            rule_loader,
            evaluator,
            snapshot_pool,
            trace_pool: TracePool::new(),
            ip_filter: RwLock::new(ip_filter),
            geoip: RwLock::new(geoip),
            rate_limiter: RwLock::new(rate_limiter),
            pool_manager,
            request_logger,
            audit_logger,
            challenge_cache,
            memory_tracker,
            supervisor,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> Arc<WafConfig> {
        Arc::clone(&self.config.read())
    }

    pub fn ip_filter(&self) -> Arc<IpFilter> {
        Arc::clone(&self.ip_filter.read())
    }

    pub fn geoip(&self) -> Arc<GeoIpGate> {
        Arc::clone(&self.geoip.read())
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter.read())
    }

    pub fn audit(&self, event: crate::logging::AuditEvent) {
        if let Some(logger) = &self.audit_logger {
            logger.enqueue(event);
        }
    }

    /// Apply a reloaded config: swap the config snapshot and rebuild only
    /// the subsystems whose sections materially changed. Rate-limiter
    /// rebuilds discard all in-flight counters by design.
    pub fn apply_config(&self, new_config: WafConfig) {
        let old = self.config();

        if new_config.ip_filtering != old.ip_filtering {
            tracing::info!("ip filtering config changed, rebuilding filter");
            *self.ip_filter.write() = Arc::new(build_ip_filter(&new_config));
        }
        if new_config.geoip != old.geoip {
            tracing::info!("geoip config changed, rebuilding gate");
            *self.geoip.write() = Arc::new(build_geoip(&new_config, &self.memory_tracker));
        }
        if new_config.rate_limiting != old.rate_limiting {
            tracing::info!("rate limiting config changed, rebuilding limiter (counters reset)");
            *self.rate_limiter.write() =
                Arc::new(RateLimiter::new(new_config.rate_limiting.to_limiter_config()));
        }

        log_config_diff(&old, &new_config);
        *self.config.write() = Arc::new(new_config);
        crate::metrics::record_config_reload();
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

fn build_ip_filter(config: &WafConfig) -> IpFilter {
    IpFilter::from_files(
        config.ip_filtering.enabled,
        config.ip_filtering.whitelist_file.as_deref().map(Path::new),
        config.ip_filtering.blacklist_file.as_deref().map(Path::new),
    )
}

fn build_geoip(config: &WafConfig, tracker: &Arc<MemoryTracker>) -> GeoIpGate {
    let db_path = if config.geoip.enabled {
        config.geoip.db_path.as_deref().map(Path::new)
    } else {
        None
    };
    GeoIpGate::new(
        db_path,
        config.geoip.allowed_countries.clone(),
        config.geoip.blocked_countries.clone(),
        Arc::clone(tracker),
    )
}

fn log_config_diff(old: &WafConfig, new: &WafConfig) {
    if old.mode != new.mode {
        tracing::info!(from = ?old.mode, to = ?new.mode, "waf mode changed");
    }
    if old.body_limit_bytes != new.body_limit_bytes {
        tracing::info!(
            from = old.body_limit_bytes,
            to = new.body_limit_bytes,
            "body limit changed"
        );
    }
    if old.domains.len() != new.domains.len() {
        tracing::info!(
            from = old.domains.len(),
            to = new.domains.len(),
            "domain count changed"
        );
    }
    if old.rules.dir != new.rules.dir {
        tracing::warn!(
            from = %old.rules.dir,
            to = %new.rules.dir,
            "rule directory changed (takes effect next rule reload)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WafMode;

    fn runtime() -> Arc<WafRuntime> {
        let mut config = WafConfig::default();
        // Point at an empty rule dir so load succeeds with zero rules.
        config.rules.dir = "/nonexistent/rampart-test-rules".into();
        WafRuntime::new(config)
    }

    #[tokio::test]
    async fn test_runtime_builds_with_defaults() {
        let rt = runtime();
        assert_eq!(rt.evaluator.rules_loaded(), 0);
        assert!(!rt.config().observe_mode());
        assert!(rt.audit_logger.is_some());
    }

    #[tokio::test]
    async fn test_apply_config_swaps_mode_without_rebuilds() {
        let rt = runtime();
        let limiter_before = Arc::as_ptr(&rt.rate_limiter());

        let mut new_config = (*rt.config()).clone();
        new_config.mode = WafMode::Observe;
        rt.apply_config(new_config);

        assert!(rt.config().observe_mode());
        // Unchanged sections keep their subsystems.
        assert_eq!(Arc::as_ptr(&rt.rate_limiter()), limiter_before);
    }

    #[tokio::test]
    async fn test_apply_config_rebuilds_changed_limiter() {
        let rt = runtime();
        // Prime a counter, then change the limiter config.
        rt.rate_limiter().check("1.2.3.4", "/");
        assert_eq!(rt.rate_limiter().active_counters(), 1);

        let mut new_config = (*rt.config()).clone();
        new_config.rate_limiting.default_limit = 7;
        rt.apply_config(new_config);

        // Rebuild discarded the counters.
        assert_eq!(rt.rate_limiter().active_counters(), 0);
        assert_eq!(rt.rate_limiter().config().default_limit, 7);
    }
}
