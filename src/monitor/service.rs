use super::watchlist::{normalize, Watchlist, WatchlistChange};
use crate::alerts::{Alert, AlertDispatcher, AlertPriority};
use crate::api::broker::{with_timeout, BrokerApi};
use crate::api::streaming::Feed;
use crate::execution::{AutoTrader, HibernationChange, Ledger, StreamManager, StreamStatus};
use crate::models::{DataKind, Signal, SignalAction};
use crate::persistence::{Checkpoint, CheckpointStore};
use crate::strategy::signals::{latest_signal, DetectorConfig};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scan_interval: Duration,
    pub fast_interval: Duration,
    pub checkpoint_interval: Duration,
    pub error_alert_every: u64,
    pub heartbeat_every: u64,
    pub max_watchlist: Option<usize>,
    pub detector: DetectorConfig,
    pub timeframe: String,
    pub history_bars: usize,
    pub call_timeout: Duration,
    pub feed: Feed,
    pub data_kinds: Vec<DataKind>,
    /// How long `stop` waits for open fill watchers
    pub watcher_drain_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            fast_interval: Duration::from_secs(2),
            checkpoint_interval: Duration::from_secs(100),
            error_alert_every: 10,
            heartbeat_every: 100,
            max_watchlist: Some(50),
            detector: DetectorConfig::default(),
            timeframe: "1Min".to_string(),
            history_bars: 390,
            call_timeout: Duration::from_secs(10),
            feed: Feed::Iex,
            data_kinds: vec![DataKind::Quotes, DataKind::Trades],
            watcher_drain_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Fast,
    Scan,
    Checkpoint,
}

impl Cycle {
    fn name(&self) -> &'static str {
        match self {
            Cycle::Fast => "fast",
            Cycle::Scan => "scan",
            Cycle::Checkpoint => "checkpoint",
        }
    }
}

/// Point-in-time view of the service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub check_count: u64,
    pub error_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub watchlist: Vec<String>,
    pub positions: usize,
    pub current_signals: usize,
    pub stream: StreamStatus,
    pub hibernating: bool,
    pub uptime_secs: Option<i64>,
}

/// Everything the cycles share
struct ServiceState {
    config: MonitorConfig,
    broker: Arc<dyn BrokerApi>,
    ledger: Arc<Ledger>,
    trader: Arc<AutoTrader>,
    stream: Arc<StreamManager>,
    alerts: Arc<AlertDispatcher>,
    store: Option<Arc<dyn CheckpointStore>>,
    watchlist: RwLock<Watchlist>,
    signals: RwLock<HashMap<String, Signal>>,
    check_count: AtomicU64,
    error_count: AtomicU64,
    fast_count: AtomicU64,
    last_check: RwLock<Option<DateTime<Utc>>>,
    last_position_count: AtomicUsize,
    stream_degraded: AtomicBool,
    hibernation_gate: tokio::sync::Mutex<()>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

/// Multi-rate monitoring loop
///
/// Three independent loops share the ledger, trader and stream:
/// - fast: refresh the ledger and run exit rules on held positions
/// - scan: detect signals across the watchlist and run entry rules
/// - checkpoint: persist watchlist, signals and counters
///
/// A failing or panicking cycle is counted and logged; the loop carries on
/// at its next tick.
pub struct MonitorService {
    state: Arc<ServiceState>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MonitorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        broker: Arc<dyn BrokerApi>,
        ledger: Arc<Ledger>,
        trader: Arc<AutoTrader>,
        stream: Arc<StreamManager>,
        alerts: Arc<AlertDispatcher>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let watchlist = Watchlist::new(config.max_watchlist);
        Self {
            state: Arc::new(ServiceState {
                config,
                broker,
                ledger,
                trader,
                stream,
                alerts,
                store,
                watchlist: RwLock::new(watchlist),
                signals: RwLock::new(HashMap::new()),
                check_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                fast_count: AtomicU64::new(0),
                last_check: RwLock::new(None),
                last_position_count: AtomicUsize::new(0),
                stream_degraded: AtomicBool::new(false),
                hibernation_gate: tokio::sync::Mutex::new(()),
                started_at: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Load the last checkpoint, if any, into the service and ledger
    pub async fn restore(&self) -> anyhow::Result<bool> {
        let Some(store) = &self.state.store else {
            return Ok(false);
        };
        let Some(checkpoint) = store.load().await.context("loading checkpoint")? else {
            return Ok(false);
        };

        {
            let mut watchlist = self.state.watchlist.write();
            for symbol in &checkpoint.watchlist {
                watchlist.add(symbol);
            }
        }
        *self.state.signals.write() = checkpoint
            .current_signals
            .iter()
            .map(|s| (s.symbol.clone(), s.clone()))
            .collect();
        self.state
            .check_count
            .store(checkpoint.check_count, Ordering::SeqCst);
        self.state
            .error_count
            .store(checkpoint.error_count, Ordering::SeqCst);
        *self.state.last_check.write() = checkpoint.last_check;
        self.state
            .ledger
            .restore(&checkpoint.profit_required, &checkpoint.recently_sold);

        tracing::info!(
            "♻️  Restored checkpoint: {} symbols, {} signals, {} checks",
            checkpoint.watchlist.len(),
            checkpoint.current_signals.len(),
            checkpoint.check_count
        );
        Ok(true)
    }

    /// Restore state, open the stream and spawn the three loops
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("monitor service already running");
        }
        self.shutdown.send_replace(false);
        *self.state.started_at.write() = Some(Utc::now());

        if let Err(e) = self.restore().await {
            tracing::error!("Checkpoint restore failed, starting fresh: {:#}", e);
        }
        if let Err(e) = self.state.ledger.refresh().await {
            self.state
                .record_error(Cycle::Fast, &format!("initial refresh: {}", e))
                .await;
        }
        self.state
            .last_position_count
            .store(self.state.ledger.position_count(), Ordering::SeqCst);

        let symbols = self.state.monitored_symbols();
        if let Err(e) = self
            .state
            .stream
            .start(&symbols, &self.state.config.data_kinds, self.state.config.feed)
            .await
        {
            self.state.running.store(false, Ordering::SeqCst);
            return Err(e).context("starting market data stream");
        }
        self.state.update_hibernation().await;

        let config = &self.state.config;
        let loops = [
            (Cycle::Fast, config.fast_interval),
            (Cycle::Scan, config.scan_interval),
            (Cycle::Checkpoint, config.checkpoint_interval),
        ];
        let mut tasks = self.tasks.lock().await;
        for (cycle, period) in loops {
            let state = Arc::clone(&self.state);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(run_loop(state, cycle, period, shutdown)));
        }

        tracing::info!(
            "🚀 Monitor started: {} symbols, fast {:?}, scan {:?}, checkpoint {:?}",
            symbols.len(),
            config.fast_interval,
            config.scan_interval,
            config.checkpoint_interval
        );
        self.state.notify(Alert::new(
            "Monitor started",
            format!("Watching {} symbols", symbols.len()),
            AlertPriority::Info,
        ));
        Ok(())
    }

    /// Cancel the loops, settle open orders, stop the stream and checkpoint
    pub async fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Monitor loop ended abnormally: {}", e);
            }
        }

        self.state
            .trader
            .drain_watchers(self.state.config.watcher_drain_timeout)
            .await;
        self.state.stream.stop().await;

        if let Err(e) = self.state.save_checkpoint().await {
            tracing::error!("Final checkpoint failed: {:#}", e);
        }

        let uptime = self
            .state
            .started_at
            .read()
            .map(|t| (Utc::now() - t).num_seconds())
            .unwrap_or_default();
        tracing::info!(
            "🛑 Monitor stopped after {}s: {} checks, {} errors",
            uptime,
            self.state.check_count.load(Ordering::SeqCst),
            self.state.error_count.load(Ordering::SeqCst)
        );
    }

    /// Add symbols to the watchlist and the stream; returns those newly added
    pub async fn add_to_watchlist(&self, symbols: &[String]) -> Vec<String> {
        let added: Vec<String> = {
            let mut watchlist = self.state.watchlist.write();
            symbols
                .iter()
                .filter(|s| watchlist.add(s))
                .map(|s| normalize(s))
                .collect()
        };
        self.state.apply_change(WatchlistChange {
            added: added.clone(),
            removed: Vec::new(),
        })
        .await;
        added
    }

    /// Remove symbols; returns those that were members
    pub async fn remove_from_watchlist(&self, symbols: &[String]) -> Vec<String> {
        let removed: Vec<String> = {
            let mut watchlist = self.state.watchlist.write();
            symbols
                .iter()
                .filter(|s| watchlist.remove(s))
                .map(|s| normalize(s))
                .collect()
        };
        self.state.apply_change(WatchlistChange {
            added: Vec::new(),
            removed: removed.clone(),
        })
        .await;
        removed
    }

    /// Align the watchlist with `active`, skipping wash-sale symbols and
    /// keeping held ones
    pub async fn sync_watchlist(&self, active: &[String]) -> WatchlistChange {
        let held = self.state.ledger.held_symbols();
        let ledger = &self.state.ledger;
        let change = self
            .state
            .watchlist
            .write()
            .sync(active, &held, |s| ledger.wash_sale_active(s));
        if !change.is_empty() {
            tracing::info!("🔁 Watchlist synced: +{:?} -{:?}", change.added, change.removed);
        }
        self.state.apply_change(change.clone()).await;
        change
    }

    pub fn watchlist(&self) -> Vec<String> {
        self.state.watchlist.read().symbols().to_vec()
    }

    pub fn current_signals(&self) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self.state.signals.read().values().cloned().collect();
        signals.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        signals
    }

    pub fn status(&self) -> ServiceStatus {
        let state = &self.state;
        ServiceStatus {
            running: state.running.load(Ordering::SeqCst),
            check_count: state.check_count.load(Ordering::SeqCst),
            error_count: state.error_count.load(Ordering::SeqCst),
            last_check: *state.last_check.read(),
            watchlist: state.watchlist.read().symbols().to_vec(),
            positions: state.ledger.position_count(),
            current_signals: state.signals.read().len(),
            stream: state.stream.status(),
            hibernating: state.stream.is_hibernating(),
            uptime_secs: state
                .started_at
                .read()
                .map(|t| (Utc::now() - t).num_seconds()),
        }
    }

    /// Run one fast cycle now
    pub async fn run_fast_cycle(&self) -> anyhow::Result<()> {
        self.state.fast_cycle().await
    }

    /// Run one scan cycle now
    pub async fn run_scan_cycle(&self) -> anyhow::Result<()> {
        self.state.scan_cycle().await
    }

    pub async fn save_checkpoint(&self) -> anyhow::Result<()> {
        self.state.save_checkpoint().await
    }

    pub async fn update_hibernation(&self) -> Option<HibernationChange> {
        self.state.update_hibernation().await
    }
}

async fn run_loop(
    state: Arc<ServiceState>,
    cycle: Cycle,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        // Spawned so a panic is contained and counted
        let cycle_state = Arc::clone(&state);
        let result = tokio::spawn(async move {
            match cycle {
                Cycle::Fast => cycle_state.fast_cycle().await,
                Cycle::Scan => cycle_state.scan_cycle().await,
                Cycle::Checkpoint => cycle_state.save_checkpoint().await,
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => state.record_error(cycle, &format!("{:#}", e)).await,
            Err(e) => state.record_error(cycle, &format!("cycle panicked: {}", e)).await,
        }
    }

    tracing::debug!("{} loop stopped", cycle.name());
}

impl ServiceState {
    /// Watchlist plus held symbols, which the stream must also cover
    fn monitored_symbols(&self) -> Vec<String> {
        let mut symbols: BTreeSet<String> = self.watchlist.read().symbols().iter().cloned().collect();
        symbols.extend(self.ledger.held_symbols());
        symbols.into_iter().collect()
    }

    fn is_idle(&self) -> bool {
        self.watchlist.read().is_empty() && self.ledger.position_count() == 0
    }

    async fn update_hibernation(&self) -> Option<HibernationChange> {
        let _gate = self.hibernation_gate.lock().await;
        let change = self.stream.set_hibernation(self.is_idle()).await;
        match change {
            Some(HibernationChange::Entered) => self.notify(Alert::new(
                "Stream hibernating",
                "Watchlist and positions are empty",
                AlertPriority::Info,
            )),
            Some(HibernationChange::Exited) => self.notify(Alert::new(
                "Stream resumed",
                "Monitoring resumed",
                AlertPriority::Info,
            )),
            None => {}
        }
        change
    }

    /// Wake or hibernate first so resubscribing is seen as leaving
    /// hibernation, then subscribe and unsubscribe
    async fn apply_change(&self, change: WatchlistChange) {
        self.update_hibernation().await;

        if !change.added.is_empty() {
            if let Err(e) = self.stream.add_symbols(&change.added).await {
                tracing::error!("Failed to subscribe {:?}: {}", change.added, e);
            }
        }
        if !change.removed.is_empty() {
            let held = self.ledger.held_symbols();
            let unwatched: Vec<String> = change
                .removed
                .iter()
                .filter(|s| !held.contains(*s))
                .cloned()
                .collect();
            self.stream.remove_symbols(&unwatched).await;
            let mut signals = self.signals.write();
            for symbol in &unwatched {
                signals.remove(symbol);
            }
        }
    }

    async fn record_error(&self, cycle: Cycle, message: &str) {
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!("❌ {} cycle error #{}: {}", cycle.name(), count, message);

        if count % self.config.error_alert_every == 0 {
            self.notify(
                Alert::new(
                    "Monitor errors",
                    format!("{} errors so far. Latest: {}", count, message),
                    AlertPriority::Warning,
                )
                .with("error_count", count),
            );
        }
    }

    /// Alert once per transition into degraded mode
    fn watch_stream_health(&self) {
        let status = self.stream.status();
        let degraded = matches!(status, StreamStatus::Degraded { .. });
        if self.stream_degraded.swap(degraded, Ordering::SeqCst) == degraded {
            return;
        }
        if let StreamStatus::Degraded { reason } = status {
            self.notify(
                Alert::new(
                    "Market data degraded",
                    format!("Streaming stopped: {}. Falling back to REST quotes", reason),
                    AlertPriority::High,
                )
                .with("reason", reason),
            );
        }
    }

    fn notify(&self, alert: Alert) {
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            alerts.send(alert).await;
        });
    }

    /// Refresh the ledger and run exit rules on every held position
    async fn fast_cycle(&self) -> anyhow::Result<()> {
        let count = self.fast_count.fetch_add(1, Ordering::SeqCst) + 1;

        self.ledger.refresh().await.context("ledger refresh")?;

        let positions = self.ledger.position_count();
        let previous = self.last_position_count.swap(positions, Ordering::SeqCst);
        if positions != previous {
            tracing::info!("📊 Position count changed: {} -> {}", previous, positions);
            self.notify(
                Alert::new(
                    "Positions changed",
                    format!("{} -> {}", previous, positions),
                    AlertPriority::Info,
                )
                .with("positions", positions),
            );
            self.update_hibernation().await;
            let subscribed = self.stream.subscribed_symbols();
            let unsubscribed: Vec<String> = self
                .ledger
                .held_symbols()
                .into_iter()
                .filter(|s| !subscribed.contains(s))
                .collect();
            if !unsubscribed.is_empty() {
                if let Err(e) = self.stream.add_symbols(&unsubscribed).await {
                    tracing::error!("Failed to subscribe held symbols: {}", e);
                }
            }
        }

        self.watch_stream_health();

        let signals = self.signals.read().clone();
        let decisions = self.trader.check_exits(&signals).await?;
        for decision in decisions.iter().filter(|d| d.is_order()) {
            tracing::info!(symbol = %decision.symbol, "💸 Exit placed: {}", decision.reason);
        }

        if count % self.config.heartbeat_every == 0 {
            tracing::info!(
                "💓 Heartbeat - fast cycle {}, watchlist: {}, positions: {}, stream: {:?}",
                count,
                self.watchlist.read().len(),
                positions,
                self.stream.status()
            );
        }
        Ok(())
    }

    /// Refresh, detect signals across the watchlist, then run entry rules
    async fn scan_cycle(&self) -> anyhow::Result<()> {
        self.check_count.fetch_add(1, Ordering::SeqCst);
        *self.last_check.write() = Some(Utc::now());

        self.ledger.refresh().await.context("ledger refresh")?;

        let symbols = self.watchlist.read().symbols().to_vec();
        let mut fresh: HashMap<String, Signal> = HashMap::new();
        let mut failures = 0;

        for symbol in &symbols {
            let bars = match with_timeout(
                self.config.call_timeout,
                self.broker.get_historical_bars(
                    symbol,
                    &self.config.timeframe,
                    self.config.history_bars,
                ),
            )
            .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(symbol = %symbol, "Bar fetch failed: {}", e);
                    continue;
                }
            };

            if let Some(mut signal) = latest_signal(&bars, &self.config.detector) {
                signal.symbol = symbol.clone();
                tracing::info!(
                    symbol = %symbol,
                    "🎯 Fresh {:?} at {:.4} ({} bars ago)",
                    signal.kind,
                    signal.price,
                    signal.samples_ago
                );
                fresh.insert(symbol.clone(), signal);
            }
        }

        *self.signals.write() = fresh.clone();

        let mut buys: Vec<&Signal> = fresh
            .values()
            .filter(|s| s.action == SignalAction::BuyCandidate)
            .collect();
        buys.sort_by_key(|s| s.samples_ago);
        for signal in buys {
            match self.trader.evaluate_entry(signal).await {
                Ok(decision) if decision.is_order() => {
                    tracing::info!(symbol = %signal.symbol, "🛒 Entry placed: {}", decision.reason);
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    tracing::error!(symbol = %signal.symbol, "Entry failed: {:#}", e);
                }
            }
        }

        self.update_hibernation().await;

        if failures > 0 && failures == symbols.len() {
            anyhow::bail!("scan failed for all {} symbols", failures);
        }
        if failures > 0 {
            tracing::warn!("Scan finished with {} failures", failures);
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut current_signals: Vec<Signal> = self.signals.read().values().cloned().collect();
        current_signals.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Checkpoint {
            watchlist: self.watchlist.read().symbols().to_vec(),
            current_signals,
            check_count: self.check_count.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
            last_check: *self.last_check.read(),
            profit_required: self.ledger.profit_required_symbols(),
            recently_sold: self.ledger.wash_sales_at(Utc::now()),
        }
    }

    async fn save_checkpoint(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoint = self.checkpoint();
        store.save(&checkpoint).await.context("saving checkpoint")?;
        tracing::debug!(
            "💾 Checkpoint saved: {} symbols, {} signals",
            checkpoint.watchlist.len(),
            checkpoint.current_signals.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::paper::PaperBroker;
    use crate::api::streaming::{StreamConnection, StreamConnector, StreamError, Subscriptions};
    use crate::execution::{StreamConfig, TraderConfig};
    use crate::models::{Bar, MarketEvent};
    use crate::persistence::FileCheckpointStore;
    use chrono::TimeZone;

    struct IdleConnector;

    struct IdleConnection;

    impl StreamConnector for IdleConnector {
        fn connect(&self, _feed: Feed) -> Result<Box<dyn StreamConnection>, StreamError> {
            Ok(Box::new(IdleConnection))
        }
    }

    impl StreamConnection for IdleConnection {
        fn subscribe(&mut self, _s: &Subscriptions) -> Result<(), StreamError> {
            Ok(())
        }

        fn unsubscribe(&mut self, _s: &Subscriptions) -> Result<(), StreamError> {
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<Vec<MarketEvent>>, StreamError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(None)
        }

        fn close(&mut self) {}
    }

    fn service(broker: Arc<PaperBroker>, store: Option<Arc<dyn CheckpointStore>>) -> MonitorService {
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
            TraderConfig::default(),
        ));
        let stream = Arc::new(StreamManager::new(
            Arc::new(IdleConnector),
            StreamConfig::default(),
        ));
        let config = MonitorConfig {
            scan_interval: Duration::from_secs(3600),
            fast_interval: Duration::from_secs(3600),
            checkpoint_interval: Duration::from_secs(3600),
            history_bars: 100,
            ..MonitorConfig::default()
        };
        MonitorService::new(config, broker, ledger, trader, stream, alerts, store)
    }

    fn bars_from(symbol: &str, closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: symbol.to_string(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000.0,
                timestamp: start + chrono::Duration::minutes(i as i64),
            })
            .collect()
    }

    fn sine(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 5.0 * (i as f64 * std::f64::consts::TAU / 40.0).sin())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watchlist_operations_are_idempotent() {
        let service = service(Arc::new(PaperBroker::new(0.0)), None);

        let added = service.add_to_watchlist(&["aapl".to_string(), "AAPL".to_string()]).await;
        assert_eq!(added, vec!["AAPL".to_string()]);
        assert!(service.add_to_watchlist(&["AAPL".to_string()]).await.is_empty());
        assert!(service.remove_from_watchlist(&["MSFT".to_string()]).await.is_empty());
        assert_eq!(service.watchlist(), vec!["AAPL".to_string()]);

        service.state.stream.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_caches_only_fresh_signals() {
        let broker = Arc::new(PaperBroker::new(100_000.0));
        broker.set_bars("FRESH", bars_from("FRESH", &sine(96)));
        // Last swing 40 bars back, then flat
        let mut stale = sine(60);
        stale.extend(std::iter::repeat(100.0).take(40));
        broker.set_bars("STALE", bars_from("STALE", &stale));
        let service = service(broker, None);
        service.state.watchlist.write().add("FRESH");
        service.state.watchlist.write().add("STALE");

        service.run_scan_cycle().await.unwrap();

        let signals = service.current_signals();
        assert!(signals.iter().all(|s| s.is_fresh(11)));
        assert!(signals.iter().all(|s| s.symbol != "STALE"));
        assert_eq!(service.status().check_count, 1);
        assert!(service.status().last_check.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_survives_single_symbol_failure() {
        let broker = Arc::new(PaperBroker::new(100_000.0));
        broker.set_bars("GOOD", bars_from("GOOD", &sine(100)));
        let service = service(broker, None);
        service.state.watchlist.write().add("GOOD");
        service.state.watchlist.write().add("MISSING");

        assert!(service.run_scan_cycle().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_round_trip_through_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));

        let first = service(Arc::new(PaperBroker::new(0.0)), Some(Arc::clone(&store)));
        first.state.watchlist.write().add("AAPL");
        first.state.check_count.store(12, Ordering::SeqCst);
        first.state.ledger.mark_profit_required("TSLA");
        first.state.ledger.mark_sold("NVDA", Utc::now());
        first.save_checkpoint().await.unwrap();

        let second = service(Arc::new(PaperBroker::new(0.0)), Some(store));
        assert!(second.restore().await.unwrap());
        assert_eq!(second.watchlist(), vec!["AAPL".to_string()]);
        assert_eq!(second.status().check_count, 12);
        assert!(second.state.ledger.is_profit_required("TSLA"));
        assert!(second.state.ledger.wash_sale_active("NVDA"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errors_are_counted_not_fatal() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.set_unavailable(true);
        let service = service(broker, None);

        assert!(service.run_fast_cycle().await.is_err());
        service
            .state
            .record_error(Cycle::Fast, "ledger refresh failed")
            .await;
        assert_eq!(service.status().error_count, 1);
    }
}
