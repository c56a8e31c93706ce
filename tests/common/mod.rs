#![allow(dead_code)]

use autotrader::alerts::AlertDispatcher;
use autotrader::api::paper::PaperBroker;
use autotrader::api::streaming::{Feed, StreamConnection, StreamConnector, StreamError, Subscriptions};
use autotrader::execution::{AutoTrader, Ledger, StreamConfig, StreamManager, TraderConfig};
use autotrader::monitor::{MonitorConfig, MonitorService};
use autotrader::persistence::CheckpointStore;
use autotrader::{MarketEvent, Position, Quote, Signal, SignalAction, SignalKind};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connector that never produces data but counts connections
#[derive(Default)]
pub struct CountingConnector {
    pub connects: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

struct QuietConnection {
    closes: Arc<AtomicUsize>,
}

impl StreamConnector for CountingConnector {
    fn connect(&self, _feed: Feed) -> Result<Box<dyn StreamConnection>, StreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(QuietConnection {
            closes: Arc::clone(&self.closes),
        }))
    }
}

impl StreamConnection for QuietConnection {
    fn subscribe(&mut self, _subscriptions: &Subscriptions) -> Result<(), StreamError> {
        Ok(())
    }

    fn unsubscribe(&mut self, _subscriptions: &Subscriptions) -> Result<(), StreamError> {
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<MarketEvent>>, StreamError> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(None)
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn position(symbol: &str, entry: f64, current: f64, qty: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        qty,
        entry_price: entry,
        current_price: current,
        unrealized_pnl: (current - entry) * qty,
        unrealized_pnl_percent: (current - entry) / entry * 100.0,
    }
}

pub fn quote(symbol: &str, bid: f64, ask: f64) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        bid,
        ask,
        bid_size: 100.0,
        ask_size: 100.0,
        timestamp: Utc::now(),
    }
}

pub fn trough(symbol: &str, price: f64, samples_ago: usize) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        kind: SignalKind::Trough,
        sample_index: 389 - samples_ago,
        price,
        samples_ago,
        action: SignalAction::BuyCandidate,
        bar_time: None,
    }
}

pub fn peak(symbol: &str, price: f64, samples_ago: usize) -> Signal {
    Signal {
        kind: SignalKind::Peak,
        action: SignalAction::SellCandidate,
        ..trough(symbol, price, samples_ago)
    }
}

pub fn trader_config() -> TraderConfig {
    TraderConfig {
        fill_timeout: Duration::from_millis(50),
        fill_poll_interval: Duration::from_millis(5),
        call_timeout: Duration::from_secs(1),
        ..TraderConfig::default()
    }
}

pub struct Harness {
    pub broker: Arc<PaperBroker>,
    pub ledger: Arc<Ledger>,
    pub trader: Arc<AutoTrader>,
    pub stream: Arc<StreamManager>,
    pub connector: Arc<CountingConnector>,
    pub service: MonitorService,
}

pub fn harness(broker: Arc<PaperBroker>, store: Option<Arc<dyn CheckpointStore>>) -> Harness {
    harness_with(broker, store, trader_config())
}

pub fn harness_with(
    broker: Arc<PaperBroker>,
    store: Option<Arc<dyn CheckpointStore>>,
    trader_config: TraderConfig,
) -> Harness {
    let ledger = Arc::new(Ledger::new(
        broker.clone(),
        Duration::from_secs(1),
        chrono::Duration::minutes(30),
    ));
    let alerts = Arc::new(AlertDispatcher::new(Vec::new(), Duration::from_millis(50)));
    let trader = Arc::new(AutoTrader::new(
        broker.clone(),
        Arc::clone(&ledger),
        Arc::clone(&alerts),
        trader_config,
    ));
    let connector = Arc::new(CountingConnector::default());
    let stream = Arc::new(StreamManager::new(
        connector.clone(),
        StreamConfig {
            join_timeout: Duration::from_secs(1),
            ..StreamConfig::default()
        },
    ));
    let config = MonitorConfig {
        scan_interval: Duration::from_secs(3600),
        fast_interval: Duration::from_secs(3600),
        checkpoint_interval: Duration::from_secs(3600),
        call_timeout: Duration::from_secs(1),
        watcher_drain_timeout: Duration::from_secs(1),
        ..MonitorConfig::default()
    };
    let service = MonitorService::new(
        config,
        broker.clone(),
        Arc::clone(&ledger),
        Arc::clone(&trader),
        Arc::clone(&stream),
        alerts,
        store,
    );
    Harness {
        broker,
        ledger,
        trader,
        stream,
        connector,
        service,
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
