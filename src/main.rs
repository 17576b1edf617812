//! Tradewatch, a conditional-trading execution engine
//!
//! Boot order: config, stores, gateway, recovery, background loops
//! (scheduler, expiry sweep, order tracker), then the HTTP transport.

use std::path::PathBuf;
use std::sync::Arc;

use tradewatch_backend::gateway::GatewayClient;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradewatch_backend::api::routes::router;
use tradewatch_backend::config::{AppConfig, ConditionRules};
use tradewatch_backend::engine::scheduler::spawn_scheduler;
use tradewatch_backend::engine::Engine;
use tradewatch_backend::gateway::HttpGateway;
use tradewatch_backend::marketdata::BarWindowCache;
use tradewatch_backend::store::StrategyStore;

#[derive(Debug, Parser)]
#[command(name = "tradewatch", about = "Conditional-trading execution engine")]
struct Cli {
    /// Path to the main config file (TOML).
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to the condition-rules file (TOML).
    #[arg(long, env = "CONDITION_RULES_PATH")]
    rules: Option<PathBuf>,

    /// HTTP listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(cli.config.as_deref()).context("load config")?);
    let rules = Arc::new(ConditionRules::load(cli.rules.as_deref()).context("load rules")?);
    info!(
        mode = ?config.ib_gateway.trading_mode,
        interval = config.worker.monitor_interval_seconds,
        threads = config.worker.configured_threads,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.runtime.data_dir).context("create data dir")?;
    let store =
        StrategyStore::open(std::path::Path::new(&config.runtime.db_path)).context("open store")?;
    let cache = BarWindowCache::open(std::path::Path::new(&config.runtime.market_cache_db_path))
        .context("open market cache")?;

    let gateway = Arc::new(HttpGateway::new(&config.ib_gateway).context("gateway client")?);
    gateway.spawn_event_poller();
    if let Err(e) = gateway.health_check().await {
        warn!(error = %e, "gateway not reachable at boot, continuing");
    }

    let engine = Engine::new(store, cache, gateway, config.clone(), rules);

    let summary = engine.recover(Utc::now()).await.context("recovery")?;
    info!(
        stale_leases = summary.stale_leases_cleared,
        reconciled = summary.orders_reconciled,
        "recovery done"
    );

    let _tracker = engine.spawn_order_tracker();
    let _expiry = engine.spawn_expiry_loop();
    let _scheduler = if config.worker.enabled {
        Some(spawn_scheduler(engine.clone()))
    } else {
        warn!("worker disabled, strategies will not be monitored");
        None
    };

    let app = router(engine);
    let addr = format!("0.0.0.0:{}", cli.port);
    info!(addr = %addr, "http transport listening");
    let listener = TcpListener::bind(&addr).await.context("bind")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
