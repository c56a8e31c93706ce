use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV bar as returned by the broker's historical data endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book quote
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Last-sale print
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Exchange trading status (halts, resumes)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingStatus {
    pub symbol: String,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Kind of live market data a stream subscription carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Trades,
    Quotes,
    Bars,
    Statuses,
}

impl DataKind {
    pub const ALL: [DataKind; 4] = [
        DataKind::Trades,
        DataKind::Quotes,
        DataKind::Bars,
        DataKind::Statuses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Trades => "trades",
            DataKind::Quotes => "quotes",
            DataKind::Bars => "bars",
            DataKind::Statuses => "statuses",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded message from the live market data connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MarketEvent {
    Trade(Trade),
    Quote(Quote),
    Bar(Bar),
    Status(TradingStatus),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::Quote(q) => &q.symbol,
            MarketEvent::Bar(b) => &b.symbol,
            MarketEvent::Status(s) => &s.symbol,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            MarketEvent::Trade(_) => DataKind::Trades,
            MarketEvent::Quote(_) => DataKind::Quotes,
            MarketEvent::Bar(_) => DataKind::Bars,
            MarketEvent::Status(_) => DataKind::Statuses,
        }
    }
}

/// Market event stamped with its arrival time in this process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub received_at: DateTime<Utc>,
    pub event: MarketEvent,
}

impl StreamEvent {
    pub fn now(event: MarketEvent) -> Self {
        Self {
            received_at: Utc::now(),
            event,
        }
    }
}

/// Turning point classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Peak,
    Trough,
}

/// What a turning point suggests doing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    BuyCandidate,
    SellCandidate,
}

impl From<SignalKind> for SignalAction {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Peak => SignalAction::SellCandidate,
            SignalKind::Trough => SignalAction::BuyCandidate,
        }
    }
}

/// Detected peak or trough. Built once per scan and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    pub sample_index: usize,
    /// Unfiltered close at `sample_index`
    pub price: f64,
    pub samples_ago: usize,
    pub action: SignalAction,
    #[serde(default)]
    pub bar_time: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn is_fresh(&self, threshold: usize) -> bool {
        self.samples_ago <= threshold
    }
}

/// Open position as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Percent, e.g. 12.0 for +12%
    pub unrealized_pnl_percent: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.qty * self.current_price
    }

    pub fn whole_shares(&self) -> u64 {
        if self.qty <= 0.0 {
            0
        } else {
            self.qty.floor() as u64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("buy"),
            OrderSide::Sell => f.write_str("sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    TimedOut,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::TimedOut
        )
    }
}

/// Broker order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
    pub filled_qty: u64,
    pub limit_price: Option<Decimal>,
    pub filled_avg_price: Option<f64>,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Limit order intent handed to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
    pub limit_price: Decimal,
    pub extended_hours: bool,
}

/// Account summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub trading_blocked: bool,
}
