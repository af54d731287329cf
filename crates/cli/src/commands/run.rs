//! Paper-mode service: engine, background tasks and the web API.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use options_guard_core::{AppConfig, ConfigWatcher};
use options_guard_gateway::{PaperBroker, PaperMarketData};
use options_guard_manager::types::ChannelKind;
use options_guard_manager::{
    AuditSink, EngineApi, EngineContext, EngineService, InAppFeed, LogChannel,
    NotificationChannel, PgAuditLog,
};
use options_guard_web_api::ApiServer;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::paper_market::PaperUniverse;

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Config profile layered over the base file (e.g. "paper")
    #[arg(long, env = "OPTIONS_GUARD_PROFILE")]
    pub profile: Option<String>,

    /// Synthetic paper market fixture
    #[arg(long, default_value = "demos/paper_market.json")]
    pub market: String,

    /// Recorded market snapshot; replaces the synthetic market when given
    #[arg(long)]
    pub snapshot: Option<String>,
}

/// Where paper market data comes from.
pub(crate) enum MarketSource {
    /// Repriced from the universe on every refresh.
    Universe(PaperUniverse),
    /// Recorded once; refreshes only restamp it.
    Snapshot,
}

impl MarketSource {
    pub(crate) fn refresh(&self, feed: &PaperMarketData, config: &AppConfig) -> Result<()> {
        let now = Utc::now();
        match self {
            Self::Universe(universe) => universe.publish(feed, config.pricing.risk_free_rate, now),
            Self::Snapshot => {
                feed.restamp(now);
                Ok(())
            }
        }
    }
}

/// Opens the market named by the arguments and publishes it once.
pub(crate) fn open_market(
    market: &str,
    snapshot: Option<&str>,
    config: &AppConfig,
) -> Result<(Arc<PaperMarketData>, MarketSource)> {
    let (feed, source) = match snapshot {
        Some(path) => {
            let feed = PaperMarketData::load(path)
                .with_context(|| format!("loading market snapshot {path}"))?;
            tracing::info!(path, symbols = ?feed.symbols(), "Market snapshot loaded");
            (feed, MarketSource::Snapshot)
        }
        None => {
            let universe = PaperUniverse::load(market)?;
            tracing::info!(
                path = market,
                underlyings = universe.underlyings.len(),
                "Paper market loaded"
            );
            (PaperMarketData::new(), MarketSource::Universe(universe))
        }
    };
    source.refresh(&feed, config)?;
    Ok((Arc::new(feed), source))
}

/// Builds and starts the engine over a paper broker.
pub(crate) fn start_engine(
    config: watch::Receiver<AppConfig>,
    feed: Arc<PaperMarketData>,
    audit: Option<Arc<dyn AuditSink>>,
) -> (Arc<EngineService>, JoinHandle<()>) {
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(InAppFeed::new()) as Arc<dyn NotificationChannel>,
        Arc::new(LogChannel::new(ChannelKind::Push)) as Arc<dyn NotificationChannel>,
        Arc::new(LogChannel::new(ChannelKind::Email)) as Arc<dyn NotificationChannel>,
    ];
    let ctx = EngineContext::new(config, feed, Arc::new(PaperBroker::default()), channels, audit);
    EngineService::start(ctx)
}

/// Runs the engine in paper mode until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if configuration, the market fixture or the audit
/// database cannot be loaded, or the web server fails to bind.
pub async fn run_service(args: RunArgs) -> Result<()> {
    let config = super::load_config(&args.config, args.profile.as_deref())?;
    tracing::info!(config = %args.config, profile = ?args.profile, "Starting options guard (paper mode)");

    let (watcher, config_rx) = ConfigWatcher::new(config.clone());
    if Path::new(&args.config).exists() {
        let path = args.config.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch(&path).await {
                tracing::error!(path = %path, error = %e, "Config watcher stopped");
            }
        });
    } else {
        tracing::warn!(path = %args.config, "Config file not found; running on defaults without reload");
    }

    let (feed, source) = open_market(&args.market, args.snapshot.as_deref(), &config)?;

    let audit: Option<Arc<dyn AuditSink>> = match &config.database.url {
        Some(url) => {
            let log = PgAuditLog::connect(url, config.database.max_connections).await?;
            Some(Arc::new(log) as Arc<dyn AuditSink>)
        }
        None => {
            tracing::info!("No database configured; audit log disabled");
            None
        }
    };

    let (service, worker) = start_engine(config_rx.clone(), Arc::clone(&feed), audit);
    let api = EngineApi::new(Arc::clone(&service));
    if let MarketSource::Universe(universe) = &source {
        for account in &universe.accounts {
            tracing::info!(user_id = %account.user_id, equity = %account.equity, "Account registered");
            api.set_account(account.clone());
        }
    }
    service.context().refresh_regime(Utc::now()).await;

    let mut tasks = service.spawn_background();

    let refresh_secs = config.scheduler.health_interval_secs.max(1);
    let market_feed = Arc::clone(&feed);
    let market_config = config_rx;
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(refresh_secs));
        loop {
            interval.tick().await;
            let config = market_config.borrow().clone();
            if let Err(e) = source.refresh(&market_feed, &config) {
                tracing::warn!(error = %e, "Paper market refresh failed");
            }
        }
    }));

    let addr = config.server.addr();
    let server = ApiServer::new(api);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(&addr).await {
            tracing::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await?;

    for task in tasks {
        task.abort();
    }
    server_handle.abort();
    worker.abort();

    tracing::info!("Options guard stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
    }
    Ok(())
}
