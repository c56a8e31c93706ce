use crate::models::{DataKind, MarketEvent, Quote, StreamEvent};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

type BufferKey = (String, DataKind);

/// Rolling event history for one (symbol, data kind)
#[derive(Debug)]
struct EventBuffer {
    events: VecDeque<StreamEvent>,
    capacity: Option<usize>,
    total_added: u64,
    last_update: Option<DateTime<Utc>>,
}

impl EventBuffer {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.unwrap_or(0).min(1024)),
            capacity,
            total_added: 0,
            last_update: None,
        }
    }

    fn push(&mut self, event: StreamEvent) {
        self.last_update = Some(event.received_at);
        self.total_added += 1;
        self.events.push_back(event);

        // Drop oldest beyond capacity
        if let Some(capacity) = self.capacity {
            while self.events.len() > capacity {
                self.events.pop_front();
            }
        }
    }
}

/// Occupancy snapshot for one buffer
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BufferStats {
    pub symbol: String,
    pub kind: DataKind,
    pub len: usize,
    pub capacity: Option<usize>,
    pub total_added: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Per-(symbol, data kind) event buffers
///
/// Each buffer has its own lock, so a writer on one symbol never blocks a
/// reader on another. Reads return copies.
#[derive(Clone)]
pub struct StreamBuffers {
    buffers: Arc<DashMap<BufferKey, Arc<Mutex<EventBuffer>>>>,
    default_capacity: Option<usize>,
}

impl StreamBuffers {
    /// Create buffer storage
    ///
    /// # Arguments
    /// * `default_capacity` - Events kept per buffer; `None` keeps everything
    pub fn new(default_capacity: Option<usize>) -> Self {
        Self {
            buffers: Arc::new(DashMap::new()),
            default_capacity,
        }
    }

    pub fn default_capacity(&self) -> Option<usize> {
        self.default_capacity
    }

    /// Create the buffer for a key if missing, with an explicit capacity
    pub fn ensure(&self, symbol: &str, kind: DataKind, capacity: Option<usize>) {
        self.buffers
            .entry((symbol.to_string(), kind))
            .or_insert_with(|| Arc::new(Mutex::new(EventBuffer::new(capacity))));
    }

    fn buffer(&self, symbol: &str, kind: DataKind) -> Option<Arc<Mutex<EventBuffer>>> {
        self.buffers
            .get(&(symbol.to_string(), kind))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Append an event to its buffer
    ///
    /// Events for a key without a buffer are dropped; buffers only come
    /// from [`StreamBuffers::ensure`]. Returns whether the event was kept.
    pub fn append(&self, event: StreamEvent) -> bool {
        let symbol = event.event.symbol();
        let kind = event.event.kind();
        match self.buffer(symbol, kind) {
            Some(buffer) => {
                buffer.lock().push(event);
                true
            }
            None => {
                tracing::trace!(symbol = %symbol, kind = ?kind, "Dropping event without a buffer");
                false
            }
        }
    }

    /// Snapshot of buffered events, oldest first
    ///
    /// # Arguments
    /// * `recent_seconds` - Only events received within this many seconds
    /// * `limit` - Keep at most this many of the newest matching events
    pub fn read(
        &self,
        symbol: &str,
        kind: DataKind,
        recent_seconds: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<StreamEvent> {
        self.read_at(symbol, kind, recent_seconds, limit, Utc::now())
    }

    pub fn read_at(
        &self,
        symbol: &str,
        kind: DataKind,
        recent_seconds: Option<u64>,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Vec<StreamEvent> {
        let Some(buffer) = self.buffer(symbol, kind) else {
            return Vec::new();
        };

        let mut events: Vec<StreamEvent> = {
            let guard = buffer.lock();
            match recent_seconds {
                Some(seconds) => {
                    let cutoff = now - Duration::seconds(seconds as i64);
                    guard
                        .events
                        .iter()
                        .filter(|e| e.received_at >= cutoff)
                        .cloned()
                        .collect()
                }
                None => guard.events.iter().cloned().collect(),
            }
        };

        if let Some(limit) = limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
        events
    }

    /// Newest quote buffered for a symbol
    pub fn latest_quote(&self, symbol: &str) -> Option<Quote> {
        let buffer = self.buffer(symbol, DataKind::Quotes)?;
        let guard = buffer.lock();
        guard.events.iter().rev().find_map(|e| match &e.event {
            MarketEvent::Quote(q) => Some(q.clone()),
            _ => None,
        })
    }

    pub fn len(&self, symbol: &str, kind: DataKind) -> usize {
        self.buffer(symbol, kind)
            .map(|b| b.lock().events.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Stats for every buffer, sorted by symbol then kind
    pub fn stats(&self) -> Vec<BufferStats> {
        let mut stats: Vec<BufferStats> = self
            .buffers
            .iter()
            .map(|entry| {
                let (symbol, kind) = entry.key();
                let guard = entry.value().lock();
                BufferStats {
                    symbol: symbol.clone(),
                    kind: *kind,
                    len: guard.events.len(),
                    capacity: guard.capacity,
                    total_added: guard.total_added,
                    last_update: guard.last_update,
                }
            })
            .collect();
        stats.sort_by(|a, b| (&a.symbol, a.kind).cmp(&(&b.symbol, b.kind)));
        stats
    }

    /// Drop every buffer for a symbol
    pub fn remove_symbol(&self, symbol: &str) {
        self.buffers.retain(|(s, _), _| s != symbol);
    }

    pub fn clear(&self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trade;

    fn trade(symbol: &str, price: f64, received_at: DateTime<Utc>) -> StreamEvent {
        StreamEvent {
            received_at,
            event: MarketEvent::Trade(Trade {
                symbol: symbol.to_string(),
                price,
                size: 100.0,
                timestamp: received_at,
            }),
        }
    }

    fn quote(symbol: &str, bid: f64, ask: f64) -> StreamEvent {
        StreamEvent::now(MarketEvent::Quote(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp: Utc::now(),
        }))
    }

    fn open(buffers: &StreamBuffers, symbol: &str) {
        for kind in [DataKind::Trades, DataKind::Quotes] {
            buffers.ensure(symbol, kind, buffers.default_capacity());
        }
    }

    fn price_of(event: &StreamEvent) -> f64 {
        match &event.event {
            MarketEvent::Trade(t) => t.price,
            _ => panic!("not a trade"),
        }
    }

    #[test]
    fn test_bounded_buffer_drops_oldest() {
        let buffers = StreamBuffers::new(Some(5));
        open(&buffers, "AAPL");
        let now = Utc::now();
        for i in 0..10 {
            buffers.append(trade("AAPL", 100.0 + i as f64, now));
        }

        let events = buffers.read("AAPL", DataKind::Trades, None, None);
        assert_eq!(events.len(), 5);
        assert_eq!(price_of(&events[0]), 105.0);
        assert_eq!(price_of(&events[4]), 109.0);

        let stats = buffers.stats();
        let trades = stats.iter().find(|s| s.kind == DataKind::Trades).unwrap();
        assert_eq!(trades.total_added, 10);
        assert_eq!(trades.len, 5);
    }

    #[test]
    fn test_unbounded_buffer_keeps_all() {
        let buffers = StreamBuffers::new(Some(5));
        buffers.ensure("NVDA", DataKind::Trades, None);
        let now = Utc::now();
        for i in 0..50 {
            buffers.append(trade("NVDA", i as f64, now));
        }
        assert_eq!(buffers.len("NVDA", DataKind::Trades), 50);
    }

    #[test]
    fn test_read_recent_and_limit() {
        let buffers = StreamBuffers::new(None);
        open(&buffers, "AAPL");
        let now = Utc::now();
        buffers.append(trade("AAPL", 1.0, now - Duration::seconds(120)));
        buffers.append(trade("AAPL", 2.0, now - Duration::seconds(30)));
        buffers.append(trade("AAPL", 3.0, now - Duration::seconds(10)));
        buffers.append(trade("AAPL", 4.0, now));

        let recent = buffers.read_at("AAPL", DataKind::Trades, Some(60), None, now);
        assert_eq!(recent.len(), 3);

        let limited = buffers.read_at("AAPL", DataKind::Trades, Some(60), Some(2), now);
        assert_eq!(limited.iter().map(price_of).collect::<Vec<_>>(), vec![3.0, 4.0]);

        assert!(buffers.read("MSFT", DataKind::Trades, None, None).is_empty());
    }

    #[test]
    fn test_read_is_snapshot() {
        let buffers = StreamBuffers::new(Some(10));
        open(&buffers, "AAPL");
        let now = Utc::now();
        buffers.append(trade("AAPL", 1.0, now));

        let snapshot = buffers.read("AAPL", DataKind::Trades, None, None);
        buffers.append(trade("AAPL", 2.0, now));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffers.len("AAPL", DataKind::Trades), 2);
    }

    #[test]
    fn test_latest_quote_and_kind_separation() {
        let buffers = StreamBuffers::new(Some(10));
        open(&buffers, "TSLA");
        buffers.append(quote("TSLA", 199.0, 201.0));
        buffers.append(quote("TSLA", 200.0, 202.0));
        buffers.append(trade("TSLA", 201.0, Utc::now()));

        let latest = buffers.latest_quote("TSLA").unwrap();
        assert_eq!(latest.ask, 202.0);
        assert_eq!(buffers.len("TSLA", DataKind::Quotes), 2);
        assert_eq!(buffers.len("TSLA", DataKind::Trades), 1);
        assert!(buffers.latest_quote("AAPL").is_none());
    }

    #[test]
    fn test_remove_symbol_and_clear() {
        let buffers = StreamBuffers::new(Some(10));
        open(&buffers, "TSLA");
        buffers.ensure("AAPL", DataKind::Trades, Some(10));
        buffers.append(quote("TSLA", 1.0, 2.0));
        buffers.append(trade("TSLA", 1.5, Utc::now()));
        buffers.append(trade("AAPL", 1.5, Utc::now()));

        buffers.remove_symbol("TSLA");
        assert_eq!(buffers.stats().len(), 1);

        buffers.clear();
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_removed_symbol_is_not_recreated_by_late_events() {
        let buffers = StreamBuffers::new(Some(10));
        buffers.ensure("GME", DataKind::Trades, None);
        assert!(buffers.append(trade("GME", 20.0, Utc::now())));

        buffers.remove_symbol("GME");
        assert!(!buffers.append(trade("GME", 21.0, Utc::now())));
        assert!(buffers.is_empty());
        assert!(buffers.read("GME", DataKind::Trades, None, None).is_empty());

        // Never subscribed
        assert!(!buffers.append(quote("AMC", 4.0, 4.1)));
        assert!(buffers.latest_quote("AMC").is_none());
    }

    #[test]
    fn test_concurrent_writers_respect_capacity() {
        use std::thread;

        let buffers = StreamBuffers::new(Some(100));
        buffers.ensure("SPY", DataKind::Trades, Some(100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffers = buffers.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        buffers.append(trade("SPY", (t * 1000 + i) as f64, Utc::now()));
                        let _ = buffers.read("SPY", DataKind::Trades, None, Some(10));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffers.len("SPY", DataKind::Trades), 100);
        assert_eq!(buffers.stats()[0].total_added, 2000);
    }
}
