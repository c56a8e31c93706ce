use super::stream_buffer::{BufferStats, StreamBuffers};
use crate::api::streaming::{Feed, StreamConnection, StreamConnector, StreamError, Subscriptions};
use crate::models::{DataKind, Quote, StreamEvent};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Lifecycle of the live market data connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamStatus {
    Stopped,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted; buffered data is still readable
    Degraded { reason: String },
    Hibernating,
}

/// Result of a hibernation toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HibernationChange {
    Entered,
    Exited,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub buffer_capacity: Option<usize>,
    /// Symbols whose buffers never drop events
    pub unbounded_symbols: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub channel_capacity: usize,
    pub join_timeout: Duration,
    pub hibernation_enabled: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: Some(5000),
            unbounded_symbols: Vec::new(),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            channel_capacity: 10_000,
            join_timeout: Duration::from_secs(5),
            hibernation_enabled: true,
        }
    }
}

/// Delay before reconnect `attempt` (1-based): `base * 2^attempt`, capped
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

enum Command {
    Subscribe(Subscriptions),
    Unsubscribe(Subscriptions),
    Stop,
}

/// State handed to the transport thread
struct SessionContext {
    connector: Arc<dyn StreamConnector>,
    feed: Feed,
    subscriptions: Arc<Mutex<Subscriptions>>,
    status: Arc<RwLock<StreamStatus>>,
    commands: Receiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    stop: Arc<AtomicBool>,
    config: StreamConfig,
}

/// One running connection thread plus the task feeding the buffers
struct Session {
    commands: Sender<Command>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pump: tokio::task::JoinHandle<()>,
}

impl Session {
    fn is_live(&self) -> bool {
        self.thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

/// Owns the single live market data connection and the buffers it feeds
///
/// The blocking transport runs on one dedicated thread. Subscription
/// changes are sent to that thread as commands so the connection is reused
/// instead of reopened. Incoming events cross a bounded channel to a tokio
/// task that appends them to the per-symbol buffers.
pub struct StreamManager {
    connector: Arc<dyn StreamConnector>,
    config: StreamConfig,
    buffers: StreamBuffers,
    subscriptions: Arc<Mutex<Subscriptions>>,
    status: Arc<RwLock<StreamStatus>>,
    kinds: RwLock<Vec<DataKind>>,
    feed: RwLock<Feed>,
    session: tokio::sync::Mutex<Option<Session>>,
    hibernating: AtomicBool,
}

impl StreamManager {
    pub fn new(connector: Arc<dyn StreamConnector>, config: StreamConfig) -> Self {
        let buffers = StreamBuffers::new(config.buffer_capacity);
        Self {
            connector,
            config,
            buffers,
            subscriptions: Arc::new(Mutex::new(Subscriptions::new())),
            status: Arc::new(RwLock::new(StreamStatus::Stopped)),
            kinds: RwLock::new(vec![DataKind::Quotes]),
            feed: RwLock::new(Feed::default()),
            session: tokio::sync::Mutex::new(None),
            hibernating: AtomicBool::new(false),
        }
    }

    /// Subscribe `symbols` for `kinds` on `feed` and open the connection
    ///
    /// Calling `start` again while a connection is live only adds the new
    /// pairs to it.
    pub async fn start(
        &self,
        symbols: &[String],
        kinds: &[DataKind],
        feed: Feed,
    ) -> Result<(), StreamError> {
        *self.kinds.write() = kinds.to_vec();
        *self.feed.write() = feed;
        self.hibernating.store(false, Ordering::SeqCst);

        tracing::info!(
            symbols = symbols.len(),
            kinds = ?kinds,
            feed = %feed,
            "Starting market data stream"
        );
        self.subscribe_and_ensure(symbols).await
    }

    /// Add symbols using the data kinds given at start
    pub async fn add_symbols(&self, symbols: &[String]) -> Result<(), StreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        if self.hibernating.swap(false, Ordering::SeqCst) {
            tracing::info!("🌅 Leaving hibernation for new symbols: {:?}", symbols);
        }
        self.subscribe_and_ensure(symbols).await
    }

    /// Unsubscribe symbols and drop their buffers
    pub async fn remove_symbols(&self, symbols: &[String]) {
        let removed = self.subscriptions.lock().remove(symbols);
        for symbol in symbols {
            self.buffers.remove_symbol(symbol);
        }
        if removed.is_empty() {
            return;
        }

        let session = self.session.lock().await;
        if let Some(session) = session.as_ref().filter(|s| s.is_live()) {
            if session.commands.send(Command::Unsubscribe(removed)).is_err() {
                tracing::debug!("Stream thread gone before unsubscribe");
            }
        }
    }

    /// Close the connection and join its thread
    pub async fn stop(&self) {
        self.shutdown_session().await;
        self.hibernating.store(false, Ordering::SeqCst);
        *self.status.write() = StreamStatus::Stopped;
        tracing::info!("🛑 Market data stream stopped");
    }

    /// Enter or leave hibernation
    ///
    /// `idle` means nothing is being monitored. Entering closes the
    /// connection but keeps subscriptions and buffered data; leaving reopens
    /// the connection when there is anything to subscribe.
    pub async fn set_hibernation(&self, idle: bool) -> Option<HibernationChange> {
        if idle {
            if !self.config.hibernation_enabled || self.hibernating.load(Ordering::SeqCst) {
                return None;
            }
            self.shutdown_session().await;
            self.hibernating.store(true, Ordering::SeqCst);
            *self.status.write() = StreamStatus::Hibernating;
            tracing::info!("😴 Stream hibernating: nothing to monitor");
            Some(HibernationChange::Entered)
        } else {
            if !self.hibernating.swap(false, Ordering::SeqCst) {
                return None;
            }
            tracing::info!("🌅 Stream leaving hibernation");
            if let Err(e) = self.ensure_session().await {
                tracing::error!("Failed to restart stream after hibernation: {}", e);
            }
            Some(HibernationChange::Exited)
        }
    }

    pub fn is_hibernating(&self) -> bool {
        self.hibernating.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StreamStatus {
        self.status.read().clone()
    }

    pub fn subscribed_symbols(&self) -> BTreeSet<String> {
        self.subscriptions.lock().symbols()
    }

    pub fn buffers(&self) -> &StreamBuffers {
        &self.buffers
    }

    /// Snapshot of buffered events; see [`StreamBuffers::read`]
    pub fn read(
        &self,
        symbol: &str,
        kind: DataKind,
        recent_seconds: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<StreamEvent> {
        self.buffers.read(symbol, kind, recent_seconds, limit)
    }

    pub fn latest_quote(&self, symbol: &str) -> Option<Quote> {
        self.buffers.latest_quote(symbol)
    }

    pub fn stats(&self) -> Vec<BufferStats> {
        self.buffers.stats()
    }

    async fn subscribe_and_ensure(&self, symbols: &[String]) -> Result<(), StreamError> {
        let kinds = self.kinds.read().clone();
        let added = self.subscriptions.lock().add(symbols, &kinds);

        for symbol in symbols {
            let capacity = if self.config.unbounded_symbols.contains(symbol) {
                None
            } else {
                self.config.buffer_capacity
            };
            for kind in &kinds {
                self.buffers.ensure(symbol, *kind, capacity);
            }
        }

        if self.hibernating.load(Ordering::SeqCst) {
            return Ok(());
        }

        let session = self.session.lock().await;
        if let Some(session) = session.as_ref().filter(|s| s.is_live()) {
            if !added.is_empty() && session.commands.send(Command::Subscribe(added)).is_err() {
                tracing::debug!("Stream thread gone before subscribe");
            }
            return Ok(());
        }
        drop(session);

        self.ensure_session().await
    }

    /// Spawn a session unless one is live or there is nothing to subscribe
    async fn ensure_session(&self) -> Result<(), StreamError> {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| s.is_live()).unwrap_or(false) {
            return Ok(());
        }
        if self.subscriptions.lock().is_empty() {
            return Ok(());
        }
        // Previous session ended (degraded); make sure its pump is gone
        if let Some(old) = guard.take() {
            old.pump.abort();
        }

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(self.config.channel_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let context = SessionContext {
            connector: Arc::clone(&self.connector),
            feed: *self.feed.read(),
            subscriptions: Arc::clone(&self.subscriptions),
            status: Arc::clone(&self.status),
            commands: command_rx,
            events: event_tx,
            stop: Arc::clone(&stop),
            config: self.config.clone(),
        };

        *self.status.write() = StreamStatus::Connecting;
        let thread = std::thread::Builder::new()
            .name("market-stream".to_string())
            .spawn(move || run_session(context))
            .map_err(|e| StreamError::Transport(format!("failed to spawn stream thread: {}", e)))?;

        let buffers = self.buffers.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                buffers.append(event);
            }
        });

        *guard = Some(Session {
            commands: command_tx,
            stop,
            thread: Some(thread),
            pump,
        });
        Ok(())
    }

    async fn shutdown_session(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };

        session.stop.store(true, Ordering::SeqCst);
        let _ = session.commands.send(Command::Stop);

        if let Some(handle) = session.thread.take() {
            let join = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(self.config.join_timeout, join).await {
                Ok(Ok(Ok(()))) => tracing::debug!("Stream thread joined"),
                Ok(Ok(Err(_))) => tracing::error!("Stream thread panicked"),
                Ok(Err(e)) => tracing::error!("Stream join task failed: {}", e),
                Err(_) => tracing::warn!(
                    "Stream thread did not stop within {:?}; detaching it",
                    self.config.join_timeout
                ),
            }
        }

        // The pump ends once the thread drops its sender
        if tokio::time::timeout(Duration::from_secs(1), &mut session.pump)
            .await
            .is_err()
        {
            session.pump.abort();
        }
    }
}

fn set_status(status: &RwLock<StreamStatus>, value: StreamStatus) {
    *status.write() = value;
}

/// Sleep for `delay`, waking early when `stop` is raised. Returns true if
/// stopped.
fn sleep_unless_stopped(delay: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
    stop.load(Ordering::SeqCst)
}

enum SessionEnd {
    Stopped,
    Failed(StreamError),
}

/// Transport thread body: connect, pump events, reconnect with backoff
fn run_session(ctx: SessionContext) {
    let mut attempt: u32 = 0;

    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        set_status(
            &ctx.status,
            if attempt == 0 {
                StreamStatus::Connecting
            } else {
                StreamStatus::Reconnecting { attempt }
            },
        );

        let failure = match ctx.connector.connect(ctx.feed) {
            Ok(mut connection) => {
                // Queued changes are covered by the full resubscribe below
                while ctx.commands.try_recv().is_ok() {}
                let snapshot = ctx.subscriptions.lock().clone();

                match connection.subscribe(&snapshot) {
                    Ok(()) => {
                        attempt = 0;
                        set_status(&ctx.status, StreamStatus::Connected);
                        tracing::info!(
                            pairs = snapshot.pair_count(),
                            "✅ Stream connected and subscribed"
                        );
                        let end = pump_events(&ctx, connection.as_mut());
                        connection.close();
                        match end {
                            SessionEnd::Stopped => break,
                            SessionEnd::Failed(e) => e,
                        }
                    }
                    Err(e) => {
                        connection.close();
                        e
                    }
                }
            }
            Err(e) => e,
        };

        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        attempt += 1;
        if let StreamError::ConnectionLimit = failure {
            tracing::error!("❌ Stream rejected: provider connection limit exceeded");
        } else {
            tracing::warn!("⚠️  Stream failure: {}", failure);
        }

        if attempt > ctx.config.max_reconnect_attempts {
            tracing::error!(
                "❌ Stream degraded after {} reconnect attempts: {}",
                ctx.config.max_reconnect_attempts,
                failure
            );
            set_status(
                &ctx.status,
                StreamStatus::Degraded {
                    reason: failure.to_string(),
                },
            );
            return;
        }

        let base = backoff_delay(attempt, ctx.config.backoff_base, ctx.config.backoff_max);
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10));
        let delay = base + Duration::from_millis(jitter_ms);
        set_status(&ctx.status, StreamStatus::Reconnecting { attempt });
        tracing::info!("🔄 Reconnecting stream in {:?} (attempt {})", delay, attempt);

        if sleep_unless_stopped(delay, &ctx.stop) {
            break;
        }
    }
}

/// Receive until stopped or the connection fails
fn pump_events(ctx: &SessionContext, connection: &mut dyn StreamConnection) -> SessionEnd {
    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            return SessionEnd::Stopped;
        }

        while let Ok(command) = ctx.commands.try_recv() {
            let result = match command {
                Command::Subscribe(subs) => connection.subscribe(&subs),
                Command::Unsubscribe(subs) => connection.unsubscribe(&subs),
                Command::Stop => return SessionEnd::Stopped,
            };
            if let Err(e) = result {
                return SessionEnd::Failed(e);
            }
        }

        match connection.recv() {
            Ok(Some(events)) => {
                for event in events {
                    // Receiver gone means the manager shut the session down
                    if ctx.events.blocking_send(StreamEvent::now(event)).is_err() {
                        return SessionEnd::Stopped;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => return SessionEnd::Failed(e),
        }
    }
}
