use crate::api::broker::{with_timeout, BrokerApi, BrokerResult};
use crate::models::{Order, OrderSide, Position};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Local claim on a symbol while one of our orders is live
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSlot {
    pub side: OrderSide,
    pub reserved_at: DateTime<Utc>,
    pub order_id: Option<String>,
}

/// Outcome of one broker refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub positions: usize,
    pub open_orders: usize,
    /// Held symbols newly marked profit-required
    pub reconciled: Vec<String>,
}

#[derive(Debug, Default)]
struct BrokerSnapshot {
    positions: BTreeMap<String, Position>,
    open_orders: HashMap<String, Vec<Order>>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Read-through view of broker positions and orders plus the flags this
/// engine owns
///
/// Broker state is replaced wholesale on every refresh. The locally owned
/// sets (profit required, wash sales, order slots) are per-key maps so the
/// fast exit cycle never waits on the scan cycle.
pub struct Ledger {
    broker: Arc<dyn BrokerApi>,
    call_timeout: std::time::Duration,
    wash_sale_cooldown: Duration,
    snapshot: RwLock<BrokerSnapshot>,
    profit_required: DashMap<String, DateTime<Utc>>,
    wash_sales: DashMap<String, DateTime<Utc>>,
    slots: DashMap<String, OrderSlot>,
    /// Buys that filled after the last refresh started
    unrefreshed_fills: DashMap<String, DateTime<Utc>>,
}

impl Ledger {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        call_timeout: std::time::Duration,
        wash_sale_cooldown: Duration,
    ) -> Self {
        Self {
            broker,
            call_timeout,
            wash_sale_cooldown,
            snapshot: RwLock::new(BrokerSnapshot::default()),
            profit_required: DashMap::new(),
            wash_sales: DashMap::new(),
            slots: DashMap::new(),
            unrefreshed_fills: DashMap::new(),
        }
    }

    /// Pull positions and open orders from the broker
    ///
    /// Any symbol the broker reports as held is marked profit-required, so
    /// positions opened before a restart are protected too.
    pub async fn refresh(&self) -> BrokerResult<RefreshSummary> {
        let started = Utc::now();
        let (positions, orders) = tokio::join!(
            with_timeout(self.call_timeout, self.broker.get_positions()),
            with_timeout(self.call_timeout, self.broker.get_open_orders()),
        );
        let positions = positions?;
        let orders = orders?;

        let mut summary = RefreshSummary {
            positions: positions.len(),
            open_orders: orders.len(),
            reconciled: Vec::new(),
        };

        let now = Utc::now();
        for position in &positions {
            if let Entry::Vacant(vacant) = self.profit_required.entry(position.symbol.clone()) {
                vacant.insert(now);
                summary.reconciled.push(position.symbol.clone());
            }
        }
        if !summary.reconciled.is_empty() {
            tracing::info!(
                "🔒 Marked held symbols profit-required: {:?}",
                summary.reconciled
            );
        }

        let mut by_symbol: HashMap<String, Vec<Order>> = HashMap::new();
        for order in orders {
            by_symbol.entry(order.symbol.clone()).or_default().push(order);
        }

        let mut snapshot = self.snapshot.write();
        snapshot.positions = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        snapshot.open_orders = by_symbol;
        snapshot.refreshed_at = Some(now);
        drop(snapshot);

        // Fills recorded before the broker calls began are in the snapshot
        self.unrefreshed_fills.retain(|_, at| *at >= started);

        Ok(summary)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.snapshot.read().positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.snapshot.read().positions.get(symbol).cloned()
    }

    /// Broker positions plus buys filled since the last refresh
    pub fn position_count(&self) -> usize {
        self.held_symbols().len()
    }

    pub fn held_symbols(&self) -> BTreeSet<String> {
        let mut held: BTreeSet<String> =
            self.snapshot.read().positions.keys().cloned().collect();
        held.extend(self.unrefreshed_fills.iter().map(|e| e.key().clone()));
        held
    }

    /// Count a filled buy as held until a refresh picks it up
    pub fn record_buy_fill(&self, symbol: &str) {
        self.unrefreshed_fills.insert(symbol.to_string(), Utc::now());
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.snapshot
            .read()
            .open_orders
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().refreshed_at
    }

    /// Claim the order slot for `symbol`
    ///
    /// Single atomic check-and-set: of any number of concurrent callers for
    /// the same symbol exactly one gets `true`.
    pub fn reserve_order_slot(&self, symbol: &str, side: OrderSide) -> bool {
        match self.slots.entry(symbol.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(OrderSlot {
                    side,
                    reserved_at: Utc::now(),
                    order_id: None,
                });
                true
            }
        }
    }

    /// Record the broker id of the order holding a slot
    pub fn attach_order(&self, symbol: &str, order_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(symbol) {
            slot.order_id = Some(order_id.to_string());
        }
    }

    pub fn release(&self, symbol: &str) {
        self.slots.remove(symbol);
    }

    pub fn order_slot(&self, symbol: &str) -> Option<OrderSlot> {
        self.slots.get(symbol).map(|slot| slot.clone())
    }

    pub fn has_order_in_flight(&self, symbol: &str) -> bool {
        self.slots.contains_key(symbol)
            || self
                .snapshot
                .read()
                .open_orders
                .get(symbol)
                .map(|orders| !orders.is_empty())
                .unwrap_or(false)
    }

    /// Buys holding a slot, counted against the position cap
    pub fn pending_buys(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.side == OrderSide::Buy)
            .count()
    }

    pub fn mark_profit_required(&self, symbol: &str) {
        self.profit_required.insert(symbol.to_string(), Utc::now());
    }

    pub fn clear_profit_required(&self, symbol: &str) {
        self.profit_required.remove(symbol);
    }

    pub fn is_profit_required(&self, symbol: &str) -> bool {
        self.profit_required.contains_key(symbol)
    }

    pub fn profit_required_symbols(&self) -> BTreeSet<String> {
        self.profit_required.iter().map(|e| e.key().clone()).collect()
    }

    /// A profitable sell filled: clear the profit flag and start the
    /// wash-sale cooldown
    pub fn mark_sold(&self, symbol: &str, at: DateTime<Utc>) {
        self.profit_required.remove(symbol);
        self.wash_sales.insert(symbol.to_string(), at);
        self.snapshot.write().positions.remove(symbol);
        self.unrefreshed_fills.remove(symbol);
        tracing::info!(symbol = %symbol, "Wash-sale cooldown started at {}", at);
    }

    /// Whether the cooldown for `symbol` is still running at `now`
    ///
    /// Expired entries are dropped on the way.
    pub fn wash_sale_active_at(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let cooldown = self.wash_sale_cooldown;
        self.wash_sales
            .remove_if(symbol, |_, sold_at| now - *sold_at >= cooldown);
        self.wash_sales.contains_key(symbol)
    }

    pub fn wash_sale_active(&self, symbol: &str) -> bool {
        self.wash_sale_active_at(symbol, Utc::now())
    }

    /// Live cooldown entries at `now`
    pub fn wash_sales_at(&self, now: DateTime<Utc>) -> BTreeMap<String, DateTime<Utc>> {
        let cooldown = self.wash_sale_cooldown;
        self.wash_sales.retain(|_, sold_at| now - *sold_at < cooldown);
        self.wash_sales
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn is_eligible_for_entry(&self, symbol: &str) -> bool {
        self.is_eligible_for_entry_at(symbol, Utc::now())
    }

    pub fn is_eligible_for_entry_at(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.entry_blocker_at(symbol, now).is_none()
    }

    /// First reason `symbol` may not be bought at `now`
    pub fn entry_blocker_at(&self, symbol: &str, now: DateTime<Utc>) -> Option<&'static str> {
        if self.snapshot.read().positions.contains_key(symbol)
            || self.unrefreshed_fills.contains_key(symbol)
        {
            return Some("position already open");
        }
        if self.has_order_in_flight(symbol) {
            return Some("order in flight");
        }
        if self.is_profit_required(symbol) {
            return Some("profit required before re-entry");
        }
        if self.wash_sale_active_at(symbol, now) {
            return Some("wash-sale cooldown");
        }
        None
    }

    /// Reinstate flags saved in a checkpoint
    pub fn restore(
        &self,
        profit_required: &BTreeSet<String>,
        wash_sales: &BTreeMap<String, DateTime<Utc>>,
    ) {
        let now = Utc::now();
        for symbol in profit_required {
            self.profit_required.insert(symbol.clone(), now);
        }
        for (symbol, sold_at) in wash_sales {
            if now - *sold_at < self.wash_sale_cooldown {
                self.wash_sales.insert(symbol.clone(), *sold_at);
            }
        }
    }
}
