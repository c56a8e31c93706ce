use anyhow::Context;
use autotrader::alerts::{AlertChannel, AlertDispatcher, LogChannel, WebhookChannel};
use autotrader::api::alpaca::{AlpacaClient, AlpacaConfig};
use autotrader::api::alpaca_stream::{AlpacaStreamConfig, AlpacaStreamConnector};
use autotrader::api::paper::PaperBroker;
use autotrader::api::BrokerApi;
use autotrader::config::{CheckpointBackend, Settings};
use autotrader::execution::{AutoTrader, Ledger, StreamManager};
use autotrader::monitor::MonitorService;
use autotrader::persistence::{CheckpointStore, FileCheckpointStore, RedisCheckpointStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Signal-driven equity trading engine
#[derive(Debug, Parser)]
#[command(name = "autotrader", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulate orders locally; market data still comes from Alpaca
    #[arg(long)]
    paper: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!("🚀 AutoTrader starting{}", if cli.paper { " (paper)" } else { "" });

    let api_key = std::env::var("ALPACA_API_KEY").context("ALPACA_API_KEY not set")?;
    let secret_key = std::env::var("ALPACA_SECRET_KEY").context("ALPACA_SECRET_KEY not set")?;

    let mut alpaca_config = AlpacaConfig::paper(api_key.clone(), secret_key.clone());
    if let Some(url) = &settings.broker.trading_url {
        alpaca_config.trading_url = url.clone();
    }
    if let Some(url) = &settings.broker.data_url {
        alpaca_config.data_url = url.clone();
    }
    alpaca_config.feed = settings.stream.feed.to_string();
    alpaca_config.request_timeout = settings.call_timeout();
    alpaca_config.rate_limit_rpm = settings.broker.requests_per_minute;
    let alpaca: Arc<dyn BrokerApi> = Arc::new(AlpacaClient::new(alpaca_config)?);

    let broker: Arc<dyn BrokerApi> = if cli.paper {
        tracing::info!(
            "📝 Paper mode: simulated fills with ${:.2} starting cash",
            settings.broker.paper_cash
        );
        Arc::new(PaperBroker::new(settings.broker.paper_cash).with_market_data(alpaca))
    } else {
        alpaca
    };

    let mut stream_config = AlpacaStreamConfig::new(api_key, secret_key);
    if let Some(url) = &settings.stream.url {
        stream_config.base_url = url.clone();
    }
    let stream = Arc::new(StreamManager::new(
        Arc::new(AlpacaStreamConnector::new(stream_config)),
        settings.stream_config(),
    ));

    let alerts = Arc::new(build_alerts(&settings));
    let store = build_checkpoint_store(&settings).await;

    let ledger = Arc::new(Ledger::new(
        Arc::clone(&broker),
        settings.call_timeout(),
        chrono::Duration::minutes(settings.trading.wash_sale_cooldown_minutes),
    ));
    let trader = Arc::new(
        AutoTrader::new(
            Arc::clone(&broker),
            Arc::clone(&ledger),
            Arc::clone(&alerts),
            settings.trader_config(),
        )
        .with_quotes(stream.buffers().clone()),
    );

    let service = MonitorService::new(
        settings.monitor_config(),
        broker,
        ledger,
        trader,
        stream,
        alerts,
        store,
    );

    if !settings.monitor.watchlist.is_empty() {
        let added = service.add_to_watchlist(&settings.monitor.watchlist).await;
        tracing::info!("📋 Watchlist from config: {:?}", added);
    }

    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("🛑 Shutdown signal received");

    service.stop().await;
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotrader=info".into()),
        )
        .init();
}

fn build_alerts(settings: &Settings) -> AlertDispatcher {
    let mut channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogChannel)];
    if let Some(url) = &settings.alerts.webhook_url {
        tracing::info!("Webhook alerts enabled");
        channels.push(Arc::new(WebhookChannel::new(url.clone())));
    }
    AlertDispatcher::new(
        channels,
        Duration::from_secs(settings.alerts.channel_timeout_secs),
    )
}

async fn build_checkpoint_store(settings: &Settings) -> Option<Arc<dyn CheckpointStore>> {
    let p = &settings.persistence;
    match p.backend {
        CheckpointBackend::File => {
            tracing::info!("File checkpoints at {}", p.path);
            Some(Arc::new(FileCheckpointStore::new(&p.path)))
        }
        CheckpointBackend::Redis => match RedisCheckpointStore::new(&p.redis_url, &p.redis_key).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to Redis ({}), continuing without checkpoints",
                    e
                );
                None
            }
        },
    }
}
