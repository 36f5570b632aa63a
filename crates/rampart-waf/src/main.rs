//! Rampart, a reverse-proxy web application firewall.
//!
//! Sits between untrusted clients and origin services and decides, per
//! request, whether to forward, block, or observe-only log it. Rules are
//! hot-reloadable YAML; admission control covers IP lists, GeoIP, and a
//! sharded rate limiter.
//!
//! ```bash
//! rampart                               # config from WAF_CONFIG_FILE or defaults
//! rampart --config /etc/rampart.yaml   # explicit config file
//! rampart validate --rules ./rules     # dry-run a rule directory
//! ```

use clap::{Parser, Subcommand};
use rampart_waf::config::{ConfigLoader, WafConfig};
use rampart_waf::proxy::WafServer;
use rampart_waf::reload;
use rampart_waf::rules::RuleLoader;
use rampart_waf::runtime::WafRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rampart")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the YAML configuration file
    #[arg(long, value_name = "FILE", env = "WAF_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WAF_LOGLEVEL")]
    loglevel: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WAF (default command)
    Run,

    /// Parse a rule directory and report problems without starting
    Validate {
        /// Rule directory to check
        #[arg(long, value_name = "DIR", env = "RULE_DIR")]
        rules: PathBuf,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let log_level = match cli.loglevel.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    match cli.command {
        Some(Commands::Validate { rules }) => validate_rules(&rules),
        Some(Commands::Run) | None => run(cli.config),
    }
}

fn validate_rules(dir: &PathBuf) -> Result<(), anyhow::Error> {
    let report = RuleLoader::validate(dir);
    info!(
        files_ok = report.files_ok,
        files_failed = report.files_failed,
        rules = report.rules_loaded,
        skipped = report.rules_skipped,
        "validation complete"
    );
    for problem in &report.errors {
        error!("{problem}");
    }
    if report.is_clean() {
        Ok(())
    } else {
        anyhow::bail!(
            "validation found {} problem(s)",
            report.files_failed + report.rules_skipped
        )
    }
}

fn run(config_path: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let config_loader = Arc::new(ConfigLoader::new(config_path));
        let config: WafConfig = config_loader.load()?;

        info!(
            mode = ?config.mode,
            http = config.server.http_enabled,
            https = config.server.https_enabled,
            rules_dir = %config.rules.dir,
            "starting rampart"
        );

        let waf = WafRuntime::new(config);
        reload::spawn_background_tasks(&waf, Arc::clone(&config_loader));

        let server = WafServer::new(Arc::clone(&waf));
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "server failed");
            }
        });

        reload::run_until_shutdown(Arc::clone(&waf), config_loader).await;
        server_task.abort();
        Ok(())
    })
}
