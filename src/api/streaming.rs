use crate::models::{DataKind, MarketEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Errors from the live market data transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    /// Provider refused the connection because another one is already live
    #[error("connection limit exceeded")]
    ConnectionLimit,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    Closed,
}

/// Market data feed the connection is opened against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    #[default]
    Iex,
    Sip,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Iex => "iex",
            Feed::Sip => "sip",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbols subscribed per data kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    by_kind: BTreeMap<DataKind, BTreeSet<String>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every (symbol, kind) pair, returning only the pairs that were new
    pub fn add(&mut self, symbols: &[String], kinds: &[DataKind]) -> Subscriptions {
        let mut added = Subscriptions::new();
        for kind in kinds {
            let set = self.by_kind.entry(*kind).or_default();
            for symbol in symbols {
                if set.insert(symbol.clone()) {
                    added.by_kind.entry(*kind).or_default().insert(symbol.clone());
                }
            }
        }
        added
    }

    /// Remove `symbols` from every kind, returning the pairs actually removed
    pub fn remove(&mut self, symbols: &[String]) -> Subscriptions {
        let mut removed = Subscriptions::new();
        for (kind, set) in self.by_kind.iter_mut() {
            for symbol in symbols {
                if set.remove(symbol) {
                    removed.by_kind.entry(*kind).or_default().insert(symbol.clone());
                }
            }
        }
        self.by_kind.retain(|_, set| !set.is_empty());
        removed
    }

    pub fn contains(&self, symbol: &str, kind: DataKind) -> bool {
        self.by_kind
            .get(&kind)
            .map(|set| set.contains(symbol))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(|set| set.is_empty())
    }

    /// Distinct symbols across all kinds
    pub fn symbols(&self) -> BTreeSet<String> {
        self.by_kind.values().flatten().cloned().collect()
    }

    pub fn kinds(&self) -> Vec<DataKind> {
        self.by_kind
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn symbols_for(&self, kind: DataKind) -> Vec<String> {
        self.by_kind
            .get(&kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pair_count(&self) -> usize {
        self.by_kind.values().map(|set| set.len()).sum()
    }
}

/// One live, blocking connection to the market data provider
///
/// Implementations are driven from a single dedicated thread.
pub trait StreamConnection: Send {
    fn subscribe(&mut self, subscriptions: &Subscriptions) -> Result<(), StreamError>;

    fn unsubscribe(&mut self, subscriptions: &Subscriptions) -> Result<(), StreamError>;

    /// Block until the next batch of events. `Ok(None)` means the read
    /// timed out with nothing to deliver.
    fn recv(&mut self) -> Result<Option<Vec<MarketEvent>>, StreamError>;

    fn close(&mut self);
}

/// Opens connections. Only one connection may be live at a time.
pub trait StreamConnector: Send + Sync {
    fn connect(&self, feed: Feed) -> Result<Box<dyn StreamConnection>, StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_reports_only_new_pairs() {
        let mut subs = Subscriptions::new();
        let added = subs.add(&syms(&["AAPL", "TSLA"]), &[DataKind::Quotes]);
        assert_eq!(added.pair_count(), 2);

        let again = subs.add(&syms(&["AAPL", "NVDA"]), &[DataKind::Quotes, DataKind::Trades]);
        assert_eq!(again.pair_count(), 3); // NVDA quotes, AAPL trades, NVDA trades
        assert!(subs.contains("AAPL", DataKind::Trades));
        assert_eq!(subs.symbols().len(), 3);
    }

    #[test]
    fn test_remove_drops_empty_kinds() {
        let mut subs = Subscriptions::new();
        subs.add(&syms(&["AAPL"]), &[DataKind::Quotes, DataKind::Bars]);

        let removed = subs.remove(&syms(&["AAPL", "MSFT"]));
        assert_eq!(removed.pair_count(), 2);
        assert!(subs.is_empty());
        assert!(subs.kinds().is_empty());
    }

    #[test]
    fn test_feed_names() {
        assert_eq!(Feed::Iex.as_str(), "iex");
        assert_eq!(Feed::Sip.to_string(), "sip");
    }
}
