use super::fill_watcher::{FillOutcome, FillWatcher};
use super::ledger::Ledger;
use super::stream_buffer::StreamBuffers;
use crate::alerts::{Alert, AlertDispatcher, AlertPriority};
use crate::api::broker::{with_timeout, BrokerApi};
use crate::models::{Order, OrderRequest, OrderSide, Position, Quote, Signal, SignalAction};
use crate::risk::guards::{self, Blocked, RiskLimits};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub limits: RiskLimits,
    /// Max bars since the extremum for a signal to be acted on
    pub freshness_threshold: usize,
    pub fill_timeout: Duration,
    pub fill_poll_interval: Duration,
    pub call_timeout: Duration,
    /// Older stream quotes fall back to the broker's latest quote
    pub max_quote_age: Duration,
    pub extended_hours: bool,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            freshness_threshold: 11,
            fill_timeout: Duration::from_secs(10),
            fill_poll_interval: Duration::from_millis(500),
            call_timeout: Duration::from_secs(10),
            max_quote_age: Duration::from_secs(60),
            extended_hours: false,
        }
    }
}

/// Per-symbol trading state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    Idle,
    BuyPending,
    Holding,
    SellPending,
}

/// Exit rules in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    FamilyProtection,
    QuickProfit,
    PeakSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeAction {
    Buy {
        qty: u64,
        limit_price: Decimal,
    },
    Sell {
        qty: u64,
        limit_price: Decimal,
        reason: ExitReason,
    },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeDecision {
    pub symbol: String,
    pub action: TradeAction,
    pub reason: String,
    /// A safety rule stopped an order
    pub blocked: bool,
}

impl TradeDecision {
    fn skip(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: TradeAction::Skip,
            reason: reason.into(),
            blocked: false,
        }
    }

    fn blocked(symbol: &str, blocked: Blocked) -> Self {
        Self {
            blocked: true,
            ..Self::skip(symbol, blocked.to_string())
        }
    }

    pub fn is_order(&self) -> bool {
        !matches!(self.action, TradeAction::Skip)
    }
}

/// Shared with fill watcher tasks
#[derive(Clone)]
struct Settlement {
    ledger: Arc<Ledger>,
    alerts: Arc<AlertDispatcher>,
    states: Arc<DashMap<String, TradeState>>,
    watcher: FillWatcher,
}

/// Turns fresh signals and live prices into limit orders
///
/// Entry and exit rules are evaluated against the ledger; every order goes
/// through the ledger's order slot so two cycles can never submit for the
/// same symbol at once. Each accepted order gets a fill watcher task that
/// cancels it after the fill timeout.
pub struct AutoTrader {
    broker: Arc<dyn BrokerApi>,
    ledger: Arc<Ledger>,
    alerts: Arc<AlertDispatcher>,
    quotes: Option<StreamBuffers>,
    config: TraderConfig,
    states: Arc<DashMap<String, TradeState>>,
    watcher: FillWatcher,
    watchers: Mutex<JoinSet<()>>,
}

impl AutoTrader {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        ledger: Arc<Ledger>,
        alerts: Arc<AlertDispatcher>,
        config: TraderConfig,
    ) -> Self {
        let watcher = FillWatcher::new(
            Arc::clone(&broker),
            config.fill_timeout,
            config.fill_poll_interval,
            config.call_timeout,
        );
        Self {
            broker,
            ledger,
            alerts,
            quotes: None,
            config,
            states: Arc::new(DashMap::new()),
            watcher,
            watchers: Mutex::new(JoinSet::new()),
        }
    }

    /// Prefer streamed quotes over broker lookups
    pub fn with_quotes(mut self, buffers: StreamBuffers) -> Self {
        self.quotes = Some(buffers);
        self
    }

    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    pub fn state(&self, symbol: &str) -> TradeState {
        self.states
            .get(symbol)
            .map(|s| *s)
            .unwrap_or(TradeState::Idle)
    }

    /// Entry rule without side effects
    pub fn plan_entry(&self, signal: &Signal, quote: &Quote, now: DateTime<Utc>) -> TradeDecision {
        let symbol = signal.symbol.as_str();
        let limits = &self.config.limits;

        if signal.action != SignalAction::BuyCandidate {
            return TradeDecision::skip(symbol, "not a buy candidate");
        }
        if !signal.is_fresh(self.config.freshness_threshold) {
            return TradeDecision::skip(
                symbol,
                format!("stale signal ({} bars ago)", signal.samples_ago),
            );
        }
        if let Some(blocker) = self.ledger.entry_blocker_at(symbol, now) {
            return TradeDecision::skip(symbol, blocker);
        }
        if let Err(blocked) = guards::check_position_cap(
            self.ledger.position_count(),
            self.ledger.pending_buys(),
            limits.max_positions,
        ) {
            return TradeDecision::blocked(symbol, blocked);
        }
        if let Err(blocked) = guards::check_anti_chase(quote.ask, signal.price, limits.anti_chase_pct) {
            return TradeDecision::blocked(symbol, blocked);
        }

        let qty = match guards::position_size(limits.position_notional, quote.ask) {
            Ok(qty) => qty,
            Err(blocked) => return TradeDecision::blocked(symbol, blocked),
        };
        let limit_price = match guards::buy_limit_price(quote.ask) {
            Ok(price) => price,
            Err(blocked) => return TradeDecision::blocked(symbol, blocked),
        };

        TradeDecision {
            symbol: symbol.to_string(),
            action: TradeAction::Buy { qty, limit_price },
            reason: format!("fresh trough at {:.4}, ask {:.4}", signal.price, quote.ask),
            blocked: false,
        }
    }

    /// Which exit rule fires for a position, if any
    ///
    /// Nothing fires unless the position is in profit.
    pub fn exit_reason(&self, position: &Position, sell_signal: Option<&Signal>) -> Option<ExitReason> {
        guards::check_profitable(position).ok()?;

        let limits = &self.config.limits;
        let pct = position.unrealized_pnl_percent;
        if pct >= limits.family_protection_pct {
            return Some(ExitReason::FamilyProtection);
        }
        if pct >= limits.quick_profit_pct {
            return Some(ExitReason::QuickProfit);
        }
        let peak = sell_signal.filter(|s| {
            s.symbol == position.symbol
                && s.action == SignalAction::SellCandidate
                && s.is_fresh(self.config.freshness_threshold)
        });
        peak.map(|_| ExitReason::PeakSignal)
    }

    /// Exit rule without side effects
    pub fn plan_exit(
        &self,
        position: &Position,
        quote: Option<&Quote>,
        sell_signal: Option<&Signal>,
    ) -> TradeDecision {
        let symbol = position.symbol.as_str();

        if let Err(blocked) = guards::check_profitable(position) {
            return TradeDecision::blocked(symbol, blocked);
        }
        let Some(reason) = self.exit_reason(position, sell_signal) else {
            return TradeDecision::skip(symbol, "no exit rule triggered");
        };

        let qty = position.whole_shares();
        if qty == 0 {
            return TradeDecision::skip(symbol, "no whole shares to sell");
        }

        let bid = quote
            .map(|q| q.bid)
            .filter(|bid| *bid > 0.0)
            .unwrap_or(position.current_price);
        let limit_price = match guards::sell_limit_price(bid) {
            Ok(price) => price,
            Err(blocked) => return TradeDecision::blocked(symbol, blocked),
        };
        if let Err(blocked) = guards::check_sell_clears_entry(limit_price, position.entry_price) {
            return TradeDecision::blocked(symbol, blocked);
        }

        TradeDecision {
            symbol: symbol.to_string(),
            action: TradeAction::Sell {
                qty,
                limit_price,
                reason,
            },
            reason: format!(
                "{:?} at {:+.2}%",
                reason, position.unrealized_pnl_percent
            ),
            blocked: false,
        }
    }

    /// Evaluate a signal for entry and place the buy if every rule passes
    pub async fn evaluate_entry(&self, signal: &Signal) -> anyhow::Result<TradeDecision> {
        self.reap_watchers();

        // Cheap checks first so ineligible symbols cost no quote lookup
        if signal.action != SignalAction::BuyCandidate {
            return Ok(TradeDecision::skip(&signal.symbol, "not a buy candidate"));
        }
        if let Some(blocker) = self.ledger.entry_blocker_at(&signal.symbol, Utc::now()) {
            return Ok(TradeDecision::skip(&signal.symbol, blocker));
        }

        let Some(quote) = self.quote_for(&signal.symbol).await else {
            return Ok(TradeDecision::skip(&signal.symbol, "no quote available"));
        };

        let decision = self.plan_entry(signal, &quote, Utc::now());
        match &decision.action {
            TradeAction::Buy { qty, limit_price } => {
                self.execute(&decision, OrderSide::Buy, *qty, *limit_price)
                    .await
            }
            _ => {
                if decision.blocked {
                    tracing::warn!(symbol = %signal.symbol, "🚫 Entry blocked: {}", decision.reason);
                } else {
                    tracing::debug!(symbol = %signal.symbol, "Entry skipped: {}", decision.reason);
                }
                Ok(decision)
            }
        }
    }

    /// Evaluate one held position against the exit rules
    pub async fn evaluate_exit(
        &self,
        position: &Position,
        sell_signal: Option<&Signal>,
    ) -> anyhow::Result<TradeDecision> {
        let symbol = position.symbol.as_str();
        if self.state(symbol) == TradeState::Idle {
            self.states.insert(symbol.to_string(), TradeState::Holding);
        }

        if self.exit_reason(position, sell_signal).is_none() {
            return Ok(self.plan_exit(position, None, sell_signal));
        }
        if self.ledger.has_order_in_flight(symbol) {
            return Ok(TradeDecision::skip(symbol, "order in flight"));
        }

        let quote = self.quote_for(symbol).await;
        let decision = self.plan_exit(position, quote.as_ref(), sell_signal);
        match &decision.action {
            TradeAction::Sell {
                qty, limit_price, ..
            } => {
                self.execute(&decision, OrderSide::Sell, *qty, *limit_price)
                    .await
            }
            _ => {
                tracing::warn!(symbol = %symbol, "🚫 Exit blocked: {}", decision.reason);
                Ok(decision)
            }
        }
    }

    /// Run the exit rules over every position in the ledger
    ///
    /// Keeps going past failures on single symbols; the error reports how
    /// many failed.
    pub async fn check_exits(
        &self,
        signals: &HashMap<String, Signal>,
    ) -> anyhow::Result<Vec<TradeDecision>> {
        self.reap_watchers();

        let mut decisions = Vec::new();
        let mut failures = 0;
        for position in self.ledger.positions() {
            match self
                .evaluate_exit(&position, signals.get(&position.symbol))
                .await
            {
                Ok(decision) => decisions.push(decision),
                Err(e) => {
                    failures += 1;
                    tracing::error!(symbol = %position.symbol, "Exit evaluation failed: {}", e);
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{} exit evaluations failed", failures);
        }
        Ok(decisions)
    }

    /// Wait for running fill watchers, aborting any still going after `limit`
    pub async fn drain_watchers(&self, limit: Duration) {
        let mut set = std::mem::take(&mut *self.watchers.lock());
        let drained = tokio::time::timeout(limit, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Fill watcher failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Aborting {} fill watchers after {:?}", set.len(), limit);
            set.abort_all();
        }
    }

    pub fn active_watchers(&self) -> usize {
        self.watchers.lock().len()
    }

    fn reap_watchers(&self) {
        let mut set = self.watchers.lock();
        while let Some(joined) = set.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("Fill watcher failed: {}", e);
            }
        }
    }

    async fn quote_for(&self, symbol: &str) -> Option<Quote> {
        if let Some(buffers) = &self.quotes {
            if let Some(quote) = buffers.latest_quote(symbol) {
                let age = (Utc::now() - quote.timestamp).to_std().unwrap_or_default();
                if quote.ask > 0.0 && age <= self.config.max_quote_age {
                    return Some(quote);
                }
            }
        }

        match with_timeout(self.config.call_timeout, self.broker.get_latest_quote(symbol)).await {
            Ok(quote) => Some(quote),
            Err(e) => {
                tracing::debug!(symbol = %symbol, "Quote lookup failed: {}", e);
                None
            }
        }
    }

    async fn execute(
        &self,
        decision: &TradeDecision,
        side: OrderSide,
        qty: u64,
        limit_price: Decimal,
    ) -> anyhow::Result<TradeDecision> {
        let symbol = decision.symbol.as_str();

        if !self.ledger.reserve_order_slot(symbol, side) {
            tracing::warn!(symbol = %symbol, "🚫 {} blocked: order slot already taken", side);
            return Ok(TradeDecision {
                blocked: true,
                ..TradeDecision::skip(symbol, "order slot already taken")
            });
        }

        let previous = self.state(symbol);
        self.states.insert(
            symbol.to_string(),
            match side {
                OrderSide::Buy => TradeState::BuyPending,
                OrderSide::Sell => TradeState::SellPending,
            },
        );

        let request = OrderRequest {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            limit_price,
            extended_hours: self.config.extended_hours,
        };

        match with_timeout(self.config.call_timeout, self.broker.submit_order(&request)).await {
            Ok(order) => {
                self.ledger.attach_order(symbol, &order.id);
                if side == OrderSide::Buy {
                    self.ledger.mark_profit_required(symbol);
                }

                tracing::info!(
                    symbol = %symbol,
                    order_id = %order.id,
                    qty,
                    limit = %limit_price,
                    "📝 {} order submitted: {}",
                    side,
                    decision.reason
                );
                self.notify(
                    Alert::new(
                        format!("{} order submitted", side),
                        format!("{} {} {} @ {}", side, qty, symbol, limit_price),
                        AlertPriority::High,
                    )
                    .with("symbol", symbol)
                    .with("order_id", order.id.clone())
                    .with("reason", decision.reason.clone()),
                );

                self.spawn_watcher(order);
                Ok(decision.clone())
            }
            Err(e) => {
                self.ledger.release(symbol);
                self.states.insert(symbol.to_string(), previous);

                if e.is_transient() {
                    return Err(anyhow::anyhow!("{} {} failed: {}", side, symbol, e));
                }

                // Not retried: a resubmission could duplicate intent
                tracing::error!(symbol = %symbol, "❌ {} order rejected: {}", side, e);
                self.notify(
                    Alert::new(
                        "Order rejected",
                        format!("{} {} {}: {}", side, qty, symbol, e),
                        AlertPriority::Critical,
                    )
                    .with("symbol", symbol),
                );
                Ok(TradeDecision::skip(symbol, format!("broker rejected: {}", e)))
            }
        }
    }

    fn spawn_watcher(&self, order: Order) {
        let settlement = Settlement {
            ledger: Arc::clone(&self.ledger),
            alerts: Arc::clone(&self.alerts),
            states: Arc::clone(&self.states),
            watcher: self.watcher.clone(),
        };
        self.watchers.lock().spawn(settle(settlement, order));
    }

    fn notify(&self, alert: Alert) {
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            alerts.send(alert).await;
        });
    }
}

/// Watch one order to completion and update ledger flags accordingly
async fn settle(ctx: Settlement, order: Order) {
    let symbol = order.symbol.clone();
    let side = order.side;
    let wanted = order.qty;
    let outcome = ctx.watcher.watch(order).await;
    let filled = outcome.filled_qty();

    let (state, alert) = match (&outcome, side) {
        (FillOutcome::Filled(o), OrderSide::Buy) => {
            ctx.ledger.record_buy_fill(&symbol);
            tracing::info!(symbol = %symbol, "✅ Buy filled: {} @ {:?}", o.filled_qty, o.filled_avg_price);
            (
                TradeState::Holding,
                Some(Alert::new("Buy filled", format!("{} {}", o.filled_qty, symbol), AlertPriority::High)),
            )
        }
        (FillOutcome::Filled(o), OrderSide::Sell) => {
            ctx.ledger.mark_sold(&symbol, Utc::now());
            tracing::info!(symbol = %symbol, "💰 Sell filled: {} @ {:?}", o.filled_qty, o.filled_avg_price);
            (
                TradeState::Idle,
                Some(Alert::new("Sell filled", format!("{} {}", o.filled_qty, symbol), AlertPriority::High)),
            )
        }
        (FillOutcome::Unknown { error, .. }, OrderSide::Buy) => {
            // Profit flag stays; the next refresh shows whether we hold it
            ctx.ledger.record_buy_fill(&symbol);
            tracing::error!(symbol = %symbol, "Buy outcome unknown: {}", error);
            (TradeState::Idle, None)
        }
        (FillOutcome::Unknown { error, .. }, OrderSide::Sell) => {
            tracing::error!(symbol = %symbol, "Sell outcome unknown: {}", error);
            (TradeState::Holding, None)
        }
        (_, OrderSide::Buy) if filled > 0 => {
            ctx.ledger.record_buy_fill(&symbol);
            tracing::warn!(symbol = %symbol, "Buy partially filled: {}/{}", filled, wanted);
            (TradeState::Holding, None)
        }
        (_, OrderSide::Buy) => {
            ctx.ledger.clear_profit_required(&symbol);
            tracing::warn!(symbol = %symbol, "Buy not filled, order closed");
            (
                TradeState::Idle,
                Some(Alert::new("Buy not filled", symbol.clone(), AlertPriority::Warning)),
            )
        }
        (_, OrderSide::Sell) => {
            tracing::warn!(symbol = %symbol, "Sell not filled ({}/{}), still holding", filled, wanted);
            (TradeState::Holding, None)
        }
    };

    ctx.states.insert(symbol.clone(), state);
    ctx.ledger.release(&symbol);

    if let Some(alert) = alert {
        ctx.alerts.send(alert.with("symbol", symbol)).await;
    }
}
