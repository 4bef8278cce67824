//! IoT Access Gateway CLI.

use anyhow::Result;
use clap::Parser;
use iot_access_gateway::cache::{Cache, MemoryCache, RedisCache};
use iot_access_gateway::config::CacheBackend;
use iot_access_gateway::oracle::JsonRpcAccessOracle;
use iot_access_gateway::{server, AccessGateway, Config, ReputationTracker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often expired entries are swept from the memory cache.
const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "iot-access-gateway")]
#[command(about = "NFT-based IoT access gateway with reputation-based rate limiting")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Listen address, overrides server.listen_address
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    // One cache for the whole process, dropped on shutdown
    let cache = open_cache(&config).await?;
    info!(backend = cache.name(), "Cache ready");

    let tracker = ReputationTracker::new(cache, config.reputation.clone())
        .with_fail_action(config.settings.fail_action)
        .with_ban_logging(config.settings.log_bans);

    let oracle = JsonRpcAccessOracle::new(config.chain.clone())?;

    let gateway = AccessGateway::new(Arc::new(tracker), Arc::new(oracle))
        .with_allowlist(config.parse_allowlist())
        .with_allowed_logging(config.settings.log_allowed);

    info!(
        contract = %config.chain.contract_address,
        max_failed_streak = config.reputation.max_failed_streak,
        ban_threshold_score = config.reputation.ban_threshold_score,
        ban_duration_seconds = config.reputation.ban_duration_seconds,
        fail_action = ?config.settings.fail_action,
        allowlist_entries = config.allowlist.len(),
        "Access gateway initialized"
    );

    let address = args
        .listen
        .unwrap_or_else(|| config.server.listen_address.clone());
    let listener = tokio::net::TcpListener::bind(&address).await?;

    server::serve(listener, server::router(Arc::new(gateway))).await?;

    info!("Access gateway shutdown complete");
    Ok(())
}

async fn open_cache(config: &Config) -> Result<Arc<dyn Cache>> {
    match config.cache.backend {
        CacheBackend::Memory => {
            let cache = Arc::new(MemoryCache::new(config.cache.max_entries));

            let sweeper = cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMORY_CLEANUP_INTERVAL);
                loop {
                    interval.tick().await;
                    sweeper.cleanup();
                }
            });

            Ok(cache)
        }
        CacheBackend::Redis => {
            let timeout = Duration::from_millis(config.cache.timeout_ms);
            let cache = RedisCache::connect(&config.cache.url, timeout).await?;
            Ok(Arc::new(cache))
        }
    }
}
