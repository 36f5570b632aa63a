//! Hot reload, background maintenance, and signal handling.
//!
//! A periodic task drives the rule loader's and config loader's
//! `check_and_reload`; further supervised tasks run rate-limiter eviction,
//! pool reaping, and cache sweeps. SIGHUP triggers the same graceful
//! reload synchronously; SIGINT/SIGTERM run the shutdown sequence (close
//! pools, flush loggers, stop supervised tasks).

use crate::config::ConfigLoader;
use crate::runtime::WafRuntime;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// One reload tick: rules first, then config.
pub fn reload_tick(runtime: &Arc<WafRuntime>, config_loader: &ConfigLoader) {
    if runtime.rule_loader.check_and_reload() {
        let snapshot = runtime.snapshot_holder.current();
        crate::metrics::set_rules_loaded(snapshot.rule_count(), snapshot.version);
        crate::metrics::record_config_reload();
        info!(
            version = snapshot.version,
            rules = snapshot.rule_count(),
            "rules reloaded"
        );
    }
    if let Some(new_config) = config_loader.check_and_reload() {
        runtime.apply_config(new_config);
        runtime.audit(crate::logging::AuditEvent {
            kind: crate::logging::AuditKind::ConfigChange,
            client_ip: "-".to_string(),
            detail: "config file reloaded".to_string(),
        });
    }
}

/// Spawn the supervised background tasks.
pub fn spawn_background_tasks(runtime: &Arc<WafRuntime>, config_loader: Arc<ConfigLoader>) {
    let reload_interval = Duration::from_secs(runtime.config().reload_interval_secs.max(1));
    let cleanup_interval =
        Duration::from_secs(runtime.config().rate_limiting.cleanup_interval_secs.max(1));

    {
        let runtime_ref = Arc::clone(runtime);
        runtime.supervisor.spawn_isolated("reload", move || {
            let runtime = Arc::clone(&runtime_ref);
            let config_loader = Arc::clone(&config_loader);
            async move {
                loop {
                    tokio::time::sleep(reload_interval).await;
                    reload_tick(&runtime, &config_loader);
                }
            }
        });
    }

    {
        let runtime_ref = Arc::clone(runtime);
        runtime
            .supervisor
            .spawn_isolated("ratelimit-eviction", move || {
                let runtime = Arc::clone(&runtime_ref);
                async move {
                    loop {
                        tokio::time::sleep(cleanup_interval).await;
                        let removed = runtime.rate_limiter().evict_stale();
                        if removed > 0 {
                            tracing::debug!(removed, "rate-limit counters evicted");
                        }
                    }
                }
            });
    }

    {
        let runtime_ref = Arc::clone(runtime);
        runtime.supervisor.spawn_isolated("pool-reaper", move || {
            let runtime = Arc::clone(&runtime_ref);
            async move {
                loop {
                    tokio::time::sleep(crate::proxy::pool::REAP_INTERVAL).await;
                    runtime.pool_manager.reap_idle().await;
                }
            }
        });
    }

    {
        let runtime_ref = Arc::clone(runtime);
        runtime.supervisor.spawn_isolated("cache-sweeper", move || {
            let runtime = Arc::clone(&runtime_ref);
            async move {
                loop {
                    tokio::time::sleep(CACHE_SWEEP_INTERVAL).await;
                    let geo = runtime.geoip().sweep_cache();
                    let acme = runtime.challenge_cache.sweep();
                    crate::metrics::set_memory_usage(runtime.memory_tracker.total_usage());
                    if geo + acme > 0 {
                        tracing::debug!(geo, acme, "cache sweep complete");
                    }
                }
            }
        });
    }
}

/// Block until a termination signal, handling SIGHUP reloads in place.
/// Returns once shutdown is complete; the caller exits 0.
#[cfg(unix)]
pub async fn run_until_shutdown(runtime: Arc<WafRuntime>, config_loader: Arc<ConfigLoader>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).expect("sighup handler installs");
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler installs");
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler installs");

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading");
                reload_tick(&runtime, &config_loader);
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    shutdown(&runtime).await;
}

#[cfg(not(unix))]
pub async fn run_until_shutdown(runtime: Arc<WafRuntime>, _config_loader: Arc<ConfigLoader>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("ctrl-c received, shutting down");
    shutdown(&runtime).await;
}

/// The shutdown sequence: pools, loggers, supervised tasks.
pub async fn shutdown(runtime: &Arc<WafRuntime>) {
    runtime.pool_manager.close_all().await;
    runtime.request_logger.shutdown().await;
    if let Some(audit) = &runtime.audit_logger {
        audit.shutdown().await;
    }
    runtime.supervisor.stop_all();
    info!("shutdown complete");
}
