use serde::Serialize;
use std::collections::BTreeSet;

/// Symbols added and removed by one change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchlistChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl WatchlistChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Ordered set of symbols being scanned
#[derive(Debug, Clone, Default)]
pub struct Watchlist {
    symbols: Vec<String>,
    max_size: Option<usize>,
}

pub fn normalize(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

impl Watchlist {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            symbols: Vec::new(),
            max_size,
        }
    }

    /// Add a symbol; false if already present, blank or the list is full
    pub fn add(&mut self, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        if symbol.is_empty() || self.contains(&symbol) {
            return false;
        }
        if let Some(max) = self.max_size {
            if self.symbols.len() >= max {
                tracing::warn!(symbol = %symbol, "Watchlist full ({}), not adding", max);
                return false;
            }
        }
        self.symbols.push(symbol);
        true
    }

    /// Remove a symbol; removing a non-member is a no-op
    pub fn remove(&mut self, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        let before = self.symbols.len();
        self.symbols.retain(|s| *s != symbol);
        self.symbols.len() != before
    }

    pub fn contains(&self, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        self.symbols.iter().any(|s| *s == symbol)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Align the list with an externally supplied set of active symbols
    ///
    /// Active symbols under wash-sale cooldown are not added. Symbols no
    /// longer active are dropped unless a position is still held in them.
    pub fn sync<F>(&mut self, active: &[String], held: &BTreeSet<String>, in_cooldown: F) -> WatchlistChange
    where
        F: Fn(&str) -> bool,
    {
        let active: BTreeSet<String> = active.iter().map(|s| normalize(s)).collect();
        let mut change = WatchlistChange::default();

        let stale: Vec<String> = self
            .symbols
            .iter()
            .filter(|s| !active.contains(*s) && !held.contains(*s))
            .cloned()
            .collect();
        for symbol in stale {
            if self.remove(&symbol) {
                change.removed.push(symbol);
            }
        }

        for symbol in &active {
            if in_cooldown(symbol) {
                tracing::debug!(symbol = %symbol, "Skipping sync add during wash-sale cooldown");
                continue;
            }
            if self.add(symbol) {
                change.added.push(symbol.clone());
            }
        }

        change
    }
}
